//! HTTP 后端 - JSON REST，基于 reqwest
//!
//! - `POST   {base}/transactions`        新建（带 `Idempotency-Key`）
//! - `PATCH  {base}/transactions/{id}`   部分更新
//! - `DELETE {base}/transactions/{id}`   删除（404 视为已删除）
//! - `GET    {base}/transactions?...`    列表

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FinsyncError, Result};
use crate::remote::{ListFilters, RemoteBackend};
use crate::sdk::HttpClientConfig;
use crate::storage::entities::{NewTransaction, TransactionPatch, TransactionRecord};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// 基于 REST 的远端后端
#[derive(Debug, Clone)]
pub struct HttpRemoteBackend {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRemoteBackend {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        api_token: Option<String>,
    ) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| FinsyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(FinsyncError::Config("api_base_url 不能为空".to_string()));
        }
        info!("✅ HTTP 后端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self) -> String {
        format!("{}/transactions", self.base_url)
    }

    fn entity_url(&self, id: &str) -> String {
        format!("{}/transactions/{}", self.base_url, id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| FinsyncError::Transport(format!("请求发送失败: {}", e)))?;
        Ok(response)
    }

    /// 非 2xx 转换为 `Server` 错误
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "无法读取错误信息".to_string());
        warn!("❌ 后端返回错误，HTTP 状态码: {}, 错误: {}", status, message);
        Err(FinsyncError::Server {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = Self::check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| FinsyncError::Serialization(format!("解析响应失败: {}", e)))
    }
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn create_entity(
        &self,
        payload: &NewTransaction,
        idempotency_key: &str,
    ) -> Result<TransactionRecord> {
        debug!("POST {} (key={})", self.collection_url(), idempotency_key);
        let request = self
            .client
            .post(self.collection_url())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(payload);
        Self::json(self.send(request).await?).await
    }

    async fn update_entity(&self, id: &str, patch: &TransactionPatch) -> Result<TransactionRecord> {
        debug!("PATCH {}", self.entity_url(id));
        let request = self.client.patch(self.entity_url(id)).json(patch);
        Self::json(self.send(request).await?).await
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        debug!("DELETE {}", self.entity_url(id));
        let response = self.send(self.client.delete(self.entity_url(id))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("删除目标已不存在，按成功处理: id={}", id);
            return Ok(());
        }
        Self::check_status(response).await?;
        Ok(())
    }

    async fn list_entities(&self, filters: &ListFilters) -> Result<Vec<TransactionRecord>> {
        let request = self.client.get(self.collection_url()).query(filters);
        Self::json(self.send(request).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpRemoteBackend {
        let config = HttpClientConfig {
            connect_timeout_secs: Some(1),
            request_timeout_secs: Some(2),
        };
        HttpRemoteBackend::new(&config, base, Some("token".into())).unwrap()
    }

    #[test]
    fn test_urls_are_normalised() {
        let backend = backend("https://api.example.com/v1/");
        assert_eq!(backend.base_url(), "https://api.example.com/v1");
        assert_eq!(
            backend.entity_url("abc"),
            "https://api.example.com/v1/transactions/abc"
        );
    }

    #[test]
    fn test_empty_base_url_is_config_error() {
        let err = HttpRemoteBackend::new(&HttpClientConfig::default(), "", None).unwrap_err();
        assert!(matches!(err, FinsyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let backend = backend("http://127.0.0.1:9");
        let err = backend.delete_entity("abc").await.unwrap_err();
        assert!(matches!(err, FinsyncError::Transport(_)));
        assert!(err.is_retryable());
    }
}
