//! 远端后端契约
//!
//! 同步引擎与会话门面只依赖 [`RemoteBackend`]；默认实现是基于 reqwest 的
//! [`HttpRemoteBackend`]。投递语义为至少一次，幂等由后端按 `Idempotency-Key` 保证。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::entities::{NewTransaction, TransactionKind, TransactionPatch, TransactionRecord};

pub mod http_client;

pub use http_client::HttpRemoteBackend;

/// 列表查询条件；全部为空时返回该用户的全部记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// 远端后端
#[async_trait]
pub trait RemoteBackend: Send + Sync + std::fmt::Debug {
    /// 新建；`idempotency_key` 为本地临时 ID，重放时保持不变
    async fn create_entity(
        &self,
        payload: &NewTransaction,
        idempotency_key: &str,
    ) -> Result<TransactionRecord>;

    async fn update_entity(&self, id: &str, patch: &TransactionPatch) -> Result<TransactionRecord>;

    /// 删除不存在的记录视为成功
    async fn delete_entity(&self, id: &str) -> Result<()>;

    async fn list_entities(&self, filters: &ListFilters) -> Result<Vec<TransactionRecord>>;
}
