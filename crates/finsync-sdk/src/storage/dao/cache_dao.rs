//! 权威快照 DAO - cached_entities 表
//!
//! 只支持整表替换，缓存读者不做局部修补。

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::entities::TransactionRecord;

pub struct CacheDao<'a> {
    conn: &'a Connection,
}

impl<'a> CacheDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 单事务内清空并重新写入；`position` 保留后端返回的顺序
    pub fn replace_all(&self, entities: &[TransactionRecord], cached_at: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM cached_entities", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO cached_entities (id, position, data, cached_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    position = excluded.position,
                    data = excluded.data,
                    cached_at = excluded.cached_at
                "#,
            )?;
            for (position, entity) in entities.iter().enumerate() {
                let data = serde_json::to_string(entity)?;
                stmt.execute(params![entity.id, position as i64, data, cached_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<TransactionRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM cached_entities ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for data in rows {
            out.push(serde_json::from_str(&data?)?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cached_entities", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM cached_entities", [])?;
        Ok(())
    }
}
