//! 存储模块 - 离线变更队列的本地持久化层
//!
//! 采用分层架构设计：
//! - LocalStore: 对外的领域 API（入队、标记同步、快照替换、元数据）
//! - DbActor: SQLite 连接独占线程，所有 SQL 经命令通道串行执行
//! - DAO Layer: 每张表一个专门的操作模块
//! - KvStore: sled 元数据集合
//!
//! 目录布局：`{data_dir}/users/{sha256(user_id)}/finsync.db` 与 `.../kv/`

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FinsyncError, Result};
use crate::utils::now_millis;

pub mod dao;
pub mod db_actor;
pub mod entities;
pub mod kv;
pub mod migrate;

pub use dao::{DaoFactory, TransactionManager};
pub use db_actor::DbActorHandle;
pub use entities::*;
pub use kv::{meta_keys, KvStore};

const DB_FILE_NAME: &str = "finsync.db";
const KV_DIR_NAME: &str = "kv";

/// 用户数据目录名：user_id 的 sha256 十六进制，避免把账号写进路径
pub fn user_dir_name(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// 本地持久化存储（单个用户会话）
///
/// 每个方法各自是一个原子单元；多步之间不提供事务。
#[derive(Debug, Clone)]
pub struct LocalStore {
    user_id: String,
    user_dir: PathBuf,
    db: Arc<DbActorHandle>,
    kv: KvStore,
}

impl LocalStore {
    /// 打开（不存在则创建）用户的本地库
    ///
    /// 目录创建失败或数据库打不开都归为 `StorageUnavailable`。
    pub async fn open(base_dir: &Path, user_id: &str) -> Result<Self> {
        if user_id.is_empty() {
            return Err(FinsyncError::InvalidArgument("user_id 不能为空".to_string()));
        }

        let user_dir = base_dir.join("users").join(user_dir_name(user_id));
        tokio::fs::create_dir_all(&user_dir).await.map_err(|e| {
            FinsyncError::StorageUnavailable(format!(
                "创建用户目录失败 {}: {}",
                user_dir.display(),
                e
            ))
        })?;

        let db = DbActorHandle::spawn()?;
        db.open(user_dir.join(DB_FILE_NAME)).await?;

        let kv = KvStore::open(&user_dir.join(KV_DIR_NAME))
            .await
            .map_err(|e| FinsyncError::StorageUnavailable(e.to_string()))?;
        kv.set(meta_keys::LAST_USER_ID, user_id)?;

        info!("📦 本地存储已打开: user={}, dir={}", user_id, user_dir.display());

        Ok(Self {
            user_id: user_id.to_string(),
            user_dir,
            db: Arc::new(db),
            kv,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// 记录一条待创建，返回新生成的本地临时 ID
    pub async fn enqueue_create(&self, payload: NewTransaction) -> Result<String> {
        self.enqueue_create_as(new_local_id(), payload).await
    }

    /// 以调用方给定的临时 ID 入队（直连失败后沿用同一幂等键）
    pub async fn enqueue_create_as(&self, local_id: String, payload: NewTransaction) -> Result<String> {
        if !is_local_id(&local_id) {
            return Err(FinsyncError::InvalidArgument(format!(
                "不是本地临时 ID: {}",
                local_id
            )));
        }
        self.db
            .insert_create(PendingCreate {
                local_id: local_id.clone(),
                payload,
                created_at: now_millis(),
                synced: false,
            })
            .await?;
        debug!("入队 create: local_id={}", local_id);
        Ok(local_id)
    }

    /// 记录一条待更新，返回日志 ID
    pub async fn enqueue_update(&self, target_entity_id: &str, patch: TransactionPatch) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .insert_update(PendingUpdate {
                id: id.clone(),
                target_entity_id: target_entity_id.to_string(),
                patch,
                created_at: now_millis(),
                synced: false,
            })
            .await?;
        debug!("入队 update: id={}, target={}", id, target_entity_id);
        Ok(id)
    }

    /// 记录一条待删除，返回日志 ID
    pub async fn enqueue_delete(&self, target_entity_id: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .insert_delete(PendingDelete {
                id: id.clone(),
                target_entity_id: target_entity_id.to_string(),
                created_at: now_millis(),
                synced: false,
            })
            .await?;
        debug!("入队 delete: id={}, target={}", id, target_entity_id);
        Ok(id)
    }

    /// 未同步条目，按插入顺序
    pub async fn list_pending(&self, kind: PendingKind) -> Result<Vec<PendingMutation>> {
        self.db.list_pending(kind).await
    }

    /// 已同步或不存在的 ID 是 no-op，返回是否真的标记了一条
    pub async fn mark_synced(&self, kind: PendingKind, id: &str) -> Result<bool> {
        self.db.mark_synced(kind, id.to_string()).await
    }

    /// 删除已同步日志；不再被未同步变更引用的临时 ID 映射一并删除
    pub async fn purge_synced(&self) -> Result<usize> {
        self.db.purge_synced().await
    }

    /// 服务端 ID 上是否还有排队中的修改或删除
    pub async fn has_pending_for(&self, target_entity_id: &str) -> Result<bool> {
        self.db.has_pending_for(target_entity_id.to_string()).await
    }

    /// 原子替换整个权威快照
    pub async fn replace_cache(&self, entities: Vec<TransactionRecord>) -> Result<()> {
        self.db.replace_cache(entities, now_millis()).await
    }

    pub async fn read_cache(&self) -> Result<Vec<TransactionRecord>> {
        self.db.read_cache().await
    }

    pub fn get_meta<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        self.kv.get(key)
    }

    pub fn set_meta<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<()> {
        self.kv.set(key, value)
    }

    pub async fn pending_count(&self) -> Result<PendingCounts> {
        self.db.pending_counts().await
    }

    pub async fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_count().await?.is_empty())
    }

    pub async fn record_id_mapping(&self, local_id: &str, server_id: &str) -> Result<()> {
        self.db
            .record_id_mapping(local_id.to_string(), server_id.to_string(), now_millis())
            .await
    }

    pub async fn resolve_id(&self, local_id: &str) -> Result<Option<String>> {
        self.db.resolve_id(local_id.to_string()).await
    }

    /// 清空该用户的全部本地数据（只在登出时显式调用）
    pub async fn clear_all(&self) -> Result<()> {
        self.db.clear_all().await?;
        self.kv.clear()?;
        info!("🧹 本地存储已清空: user={}", self.user_id);
        Ok(())
    }

    /// 落盘并关闭数据库；之后的调用返回 `StorageUnavailable`
    pub async fn close(&self) -> Result<()> {
        self.kv.flush().await?;
        self.db.close().await?;
        info!("本地存储已关闭: user={}", self.user_id);
        Ok(())
    }
}
