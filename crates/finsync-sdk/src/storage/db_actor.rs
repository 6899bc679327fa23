//! 数据库 Actor - 单线程数据库访问模型
//!
//! 核心设计：
//! - SQLite Connection 永远只在一个专用线程中
//! - 所有数据库操作通过 channel 发送命令，每条命令是一个原子单元
//! - 结果经 tokio oneshot 回传，调用方可以直接 `.await`

use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{FinsyncError, Result};
use crate::storage::dao::{DaoFactory, TransactionManager};
use crate::storage::entities::{
    PendingCounts, PendingCreate, PendingDelete, PendingKind, PendingMutation, PendingUpdate,
    TransactionRecord,
};
use crate::storage::migrate;

/// 数据库命令
pub enum DbCommand {
    /// 打开（或复用）数据库并执行 migrations
    Open {
        db_path: PathBuf,
        respond_to: oneshot::Sender<Result<()>>,
    },

    InsertCreate {
        create: PendingCreate,
        respond_to: oneshot::Sender<Result<()>>,
    },

    InsertUpdate {
        update: PendingUpdate,
        respond_to: oneshot::Sender<Result<()>>,
    },

    InsertDelete {
        delete: PendingDelete,
        respond_to: oneshot::Sender<Result<()>>,
    },

    /// 某一类未同步日志，按插入顺序
    ListPending {
        kind: PendingKind,
        respond_to: oneshot::Sender<Result<Vec<PendingMutation>>>,
    },

    MarkSynced {
        kind: PendingKind,
        id: String,
        respond_to: oneshot::Sender<Result<bool>>,
    },

    /// 清理已同步日志，并删除不再被引用的 ID 映射
    PurgeSynced {
        respond_to: oneshot::Sender<Result<usize>>,
    },

    /// 服务端 ID 上是否还有未同步的修改或删除
    HasPendingFor {
        target: String,
        respond_to: oneshot::Sender<Result<bool>>,
    },

    /// 整表替换权威快照
    ReplaceCache {
        entities: Vec<TransactionRecord>,
        cached_at: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },

    ReadCache {
        respond_to: oneshot::Sender<Result<Vec<TransactionRecord>>>,
    },

    PendingCounts {
        respond_to: oneshot::Sender<Result<PendingCounts>>,
    },

    RecordIdMapping {
        local_id: String,
        server_id: String,
        created_at: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },

    ResolveId {
        local_id: String,
        respond_to: oneshot::Sender<Result<Option<String>>>,
    },

    /// 清空日志、快照与 ID 映射（登出）
    ClearAll {
        respond_to: oneshot::Sender<Result<()>>,
    },

    /// 关闭连接，Actor 继续存活
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },

    /// 停止 Actor 线程
    Shutdown,
}

/// 数据库 Actor（运行在独立线程）
struct DbActor {
    conn: Option<Connection>,
    db_path: Option<PathBuf>,
    receiver: Receiver<DbCommand>,
    thread_id: thread::ThreadId,
}

impl DbActor {
    fn new(receiver: Receiver<DbCommand>) -> Self {
        let thread_id = thread::current().id();
        debug!("🚀 [Thread {:?}] DbActor 已启动", thread_id);
        Self {
            conn: None,
            db_path: None,
            receiver,
            thread_id,
        }
    }

    /// 运行 Actor 主循环
    fn run(mut self) {
        while let Ok(command) = self.receiver.recv() {
            match command {
                DbCommand::Shutdown => {
                    debug!("🛑 [Thread {:?}] DbActor 收到停止信号", self.thread_id);
                    break;
                }
                DbCommand::Open {
                    db_path,
                    respond_to,
                } => {
                    let result = self.handle_open(&db_path);
                    let _ = respond_to.send(result);
                }
                DbCommand::InsertCreate { create, respond_to } => {
                    let result = self.with_conn(|c| DaoFactory::pending_dao(c).insert_create(&create));
                    let _ = respond_to.send(result);
                }
                DbCommand::InsertUpdate { update, respond_to } => {
                    let result = self.with_conn(|c| DaoFactory::pending_dao(c).insert_update(&update));
                    let _ = respond_to.send(result);
                }
                DbCommand::InsertDelete { delete, respond_to } => {
                    let result = self.with_conn(|c| DaoFactory::pending_dao(c).insert_delete(&delete));
                    let _ = respond_to.send(result);
                }
                DbCommand::ListPending { kind, respond_to } => {
                    let result = self.with_conn(|c| DaoFactory::pending_dao(c).list_unsynced(kind));
                    let _ = respond_to.send(result);
                }
                DbCommand::MarkSynced {
                    kind,
                    id,
                    respond_to,
                } => {
                    let result = self.with_conn(|c| DaoFactory::pending_dao(c).mark_synced(kind, &id));
                    let _ = respond_to.send(result);
                }
                DbCommand::PurgeSynced { respond_to } => {
                    let result = self.with_conn(|c| {
                        TransactionManager::new(c).execute(|c| {
                            let purged = DaoFactory::pending_dao(c).purge_synced()?;
                            let pruned = DaoFactory::id_map_dao(c).prune_unreferenced()?;
                            debug!("清理已同步日志 {} 条, ID 映射 {} 条", purged, pruned);
                            Ok(purged)
                        })
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::HasPendingFor { target, respond_to } => {
                    let result = self
                        .with_conn(|c| DaoFactory::pending_dao(c).has_unsynced_for_target(&target));
                    let _ = respond_to.send(result);
                }
                DbCommand::ReplaceCache {
                    entities,
                    cached_at,
                    respond_to,
                } => {
                    let result =
                        self.with_conn(|c| DaoFactory::cache_dao(c).replace_all(&entities, cached_at));
                    let _ = respond_to.send(result);
                }
                DbCommand::ReadCache { respond_to } => {
                    let result = self.with_conn(|c| DaoFactory::cache_dao(c).list());
                    let _ = respond_to.send(result);
                }
                DbCommand::PendingCounts { respond_to } => {
                    let result = self.with_conn(|c| DaoFactory::pending_dao(c).count_unsynced());
                    let _ = respond_to.send(result);
                }
                DbCommand::RecordIdMapping {
                    local_id,
                    server_id,
                    created_at,
                    respond_to,
                } => {
                    let result = self.with_conn(|c| {
                        DaoFactory::id_map_dao(c).upsert(&local_id, &server_id, created_at)
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::ResolveId {
                    local_id,
                    respond_to,
                } => {
                    let result = self.with_conn(|c| DaoFactory::id_map_dao(c).resolve(&local_id));
                    let _ = respond_to.send(result);
                }
                DbCommand::ClearAll { respond_to } => {
                    let result = self.with_conn(|c| {
                        TransactionManager::new(c).execute(|c| {
                            DaoFactory::pending_dao(c).clear_all()?;
                            DaoFactory::cache_dao(c).clear()?;
                            DaoFactory::id_map_dao(c).clear()
                        })
                    });
                    let _ = respond_to.send(result);
                }
                DbCommand::Close { respond_to } => {
                    let result = self.handle_close();
                    let _ = respond_to.send(result);
                }
            }
        }

        if let Err(e) = self.handle_close() {
            warn!("DbActor 退出时关闭连接失败: {}", e);
        }
        debug!("✅ [Thread {:?}] DbActor 已停止", self.thread_id);
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| FinsyncError::StorageUnavailable("数据库未打开".to_string()))?;
        f(conn)
    }

    /// 同一路径重复打开直接复用现有连接
    fn handle_open(&mut self, db_path: &Path) -> Result<()> {
        if self.conn.is_some() && self.db_path.as_deref() == Some(db_path) {
            debug!("数据库已打开，跳过: {}", db_path.display());
            return Ok(());
        }
        self.handle_close()?;

        info!("🔨 打开本地数据库: {}", db_path.display());
        let mut conn = Connection::open(db_path).map_err(|e| {
            error!("❌ 打开数据库失败: path={}, error={}", db_path.display(), e);
            FinsyncError::StorageUnavailable(format!("打开数据库失败: {}", e))
        })?;

        migrate::init_db(&mut conn).map_err(|e| match e {
            FinsyncError::StorageUnavailable(_) => e,
            other => FinsyncError::StorageUnavailable(format!("初始化数据库失败: {}", other)),
        })?;

        self.conn = Some(conn);
        self.db_path = Some(db_path.to_path_buf());
        Ok(())
    }

    fn handle_close(&mut self) -> Result<()> {
        self.db_path = None;
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, e)| FinsyncError::Database(format!("关闭数据库失败: {}", e)))?;
        }
        Ok(())
    }
}

/// DB Actor 句柄，drop 时停止线程
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
}

impl std::fmt::Debug for DbActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbActorHandle")
            .field("sender", &"<channel>")
            .finish()
    }
}

impl DbActorHandle {
    /// 启动 DB Actor 专用线程
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = unbounded();

        thread::Builder::new()
            .name("db-actor".to_string())
            .spawn(move || DbActor::new(receiver).run())
            .map_err(|e| FinsyncError::StorageUnavailable(format!("无法启动 DB Actor 线程: {}", e)))?;

        Ok(Self { sender })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> DbCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| FinsyncError::Database("DB Actor 已停止".to_string()))?;
        rx.await
            .map_err(|_| FinsyncError::Database("DB Actor 响应失败".to_string()))?
    }

    pub async fn open(&self, db_path: PathBuf) -> Result<()> {
        self.request(|respond_to| DbCommand::Open {
            db_path,
            respond_to,
        })
        .await
    }

    pub async fn insert_create(&self, create: PendingCreate) -> Result<()> {
        self.request(|respond_to| DbCommand::InsertCreate { create, respond_to })
            .await
    }

    pub async fn insert_update(&self, update: PendingUpdate) -> Result<()> {
        self.request(|respond_to| DbCommand::InsertUpdate { update, respond_to })
            .await
    }

    pub async fn insert_delete(&self, delete: PendingDelete) -> Result<()> {
        self.request(|respond_to| DbCommand::InsertDelete { delete, respond_to })
            .await
    }

    pub async fn list_pending(&self, kind: PendingKind) -> Result<Vec<PendingMutation>> {
        self.request(|respond_to| DbCommand::ListPending { kind, respond_to })
            .await
    }

    pub async fn mark_synced(&self, kind: PendingKind, id: String) -> Result<bool> {
        self.request(|respond_to| DbCommand::MarkSynced {
            kind,
            id,
            respond_to,
        })
        .await
    }

    pub async fn purge_synced(&self) -> Result<usize> {
        self.request(|respond_to| DbCommand::PurgeSynced { respond_to })
            .await
    }

    pub async fn has_pending_for(&self, target: String) -> Result<bool> {
        self.request(|respond_to| DbCommand::HasPendingFor { target, respond_to })
            .await
    }

    pub async fn replace_cache(&self, entities: Vec<TransactionRecord>, cached_at: i64) -> Result<()> {
        self.request(|respond_to| DbCommand::ReplaceCache {
            entities,
            cached_at,
            respond_to,
        })
        .await
    }

    pub async fn read_cache(&self) -> Result<Vec<TransactionRecord>> {
        self.request(|respond_to| DbCommand::ReadCache { respond_to })
            .await
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        self.request(|respond_to| DbCommand::PendingCounts { respond_to })
            .await
    }

    pub async fn record_id_mapping(
        &self,
        local_id: String,
        server_id: String,
        created_at: i64,
    ) -> Result<()> {
        self.request(|respond_to| DbCommand::RecordIdMapping {
            local_id,
            server_id,
            created_at,
            respond_to,
        })
        .await
    }

    pub async fn resolve_id(&self, local_id: String) -> Result<Option<String>> {
        self.request(|respond_to| DbCommand::ResolveId {
            local_id,
            respond_to,
        })
        .await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.request(|respond_to| DbCommand::ClearAll { respond_to })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.request(|respond_to| DbCommand::Close { respond_to })
            .await
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(DbCommand::Shutdown);
    }
}

impl Drop for DbActorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{NewTransaction, TransactionKind};

    #[tokio::test]
    async fn test_commands_before_open_report_storage_unavailable() {
        let actor = DbActorHandle::spawn().unwrap();
        let err = actor.pending_counts().await.unwrap_err();
        assert!(matches!(err, FinsyncError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_clear_all_wipes_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finsync.db");
        let actor = DbActorHandle::spawn().unwrap();
        actor.open(path.clone()).await.unwrap();
        actor.open(path).await.unwrap();

        actor
            .insert_create(PendingCreate {
                local_id: "local_1".into(),
                payload: NewTransaction::new(3.0, TransactionKind::Expense, "coffee"),
                created_at: 1,
                synced: false,
            })
            .await
            .unwrap();
        actor
            .record_id_mapping("local_1".into(), "srv-1".into(), 1)
            .await
            .unwrap();
        assert_eq!(actor.pending_counts().await.unwrap().create, 1);

        actor.clear_all().await.unwrap();
        assert!(actor.pending_counts().await.unwrap().is_empty());
        assert_eq!(actor.resolve_id("local_1".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stopped_actor_returns_error() {
        let actor = DbActorHandle::spawn().unwrap();
        actor.shutdown();
        // 线程退出后 channel 断开
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(actor.read_cache().await.is_err());
    }
}
