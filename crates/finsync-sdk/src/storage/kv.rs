//! KV 存储模块 - 基于 sled 的元数据集合
//!
//! 每个用户目录下一个 sled 实例，只有一个 `meta` Tree：
//! `last_sync_time`、`last_user_id` 等小体量键值，值统一用 serde_json 编码。

use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};

use crate::error::{FinsyncError, Result};

/// 元数据键
pub mod meta_keys {
    /// 最近一次同步完成时间（毫秒时间戳）
    pub const LAST_SYNC_TIME: &str = "last_sync_time";
    /// 最近一次打开本地库的用户
    pub const LAST_USER_ID: &str = "last_user_id";
}

const META_TREE: &str = "meta";

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    db: Db,
    meta: Tree,
}

impl KvStore {
    /// 打开 `kv_path` 下的 sled 数据库
    pub async fn open(kv_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(kv_path)
            .await
            .map_err(|e| FinsyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 同一目录刚关闭的旧实例可能还没释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::debug!("sled 被占用，{}ms 后重试 (attempt={})", delay_ms, attempt + 1);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            FinsyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let meta = db
            .open_tree(META_TREE)
            .map_err(|e| FinsyncError::KvStore(format!("打开 meta Tree 失败: {}", e)))?;

        Ok(Self {
            path: kv_path.to_path_buf(),
            db,
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize + ?Sized,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FinsyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.meta
            .insert(key, value_bytes)
            .map_err(|e| FinsyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub fn get<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let result = self
            .meta
            .get(key)
            .map_err(|e| FinsyncError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| FinsyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 返回是否真的删除了一个键
    pub fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .meta
            .remove(key)
            .map_err(|e| FinsyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    pub fn clear(&self) -> Result<()> {
        self.meta
            .clear()
            .map_err(|e| FinsyncError::KvStore(format!("清空 meta 失败: {}", e)))
    }

    /// 落盘，关闭前调用
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FinsyncError::KvStore(format!("sled flush 失败: {}", e)))?;
        Ok(())
    }
}
