//! 数据访问层 (DAO) - 每张表一个专门的操作模块
//!
//! 所有 DAO 只借用 `&Connection`，连接本身归 DB Actor 线程所有。

pub mod cache_dao;
pub mod id_map_dao;
pub mod pending_dao;

pub use cache_dao::CacheDao;
pub use id_map_dao::IdMapDao;
pub use pending_dao::PendingDao;

use rusqlite::Connection;

use crate::error::{FinsyncError, Result};

/// DAO 工厂 - 统一创建各种 DAO 实例
pub struct DaoFactory;

impl DaoFactory {
    pub fn pending_dao(conn: &Connection) -> PendingDao<'_> {
        PendingDao::new(conn)
    }

    pub fn cache_dao(conn: &Connection) -> CacheDao<'_> {
        CacheDao::new(conn)
    }

    pub fn id_map_dao(conn: &Connection) -> IdMapDao<'_> {
        IdMapDao::new(conn)
    }
}

/// 事务管理器 - 统一管理跨表操作的事务
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 闭包返回错误时事务随 drop 回滚
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| FinsyncError::Database(format!("开始事务失败: {}", e)))?;

        let result = f(self.conn)?;

        tx.commit()
            .map_err(|e| FinsyncError::Database(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}
