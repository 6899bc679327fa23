//! 待同步日志 DAO - pending_creates / pending_updates / pending_deletes
//!
//! 三张表互相独立，无外键；`seq` 自增列保证插入顺序。

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::entities::{
    PendingCounts, PendingCreate, PendingDelete, PendingKind, PendingMutation, PendingUpdate,
};

pub struct PendingDao<'a> {
    conn: &'a Connection,
}

impl<'a> PendingDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert_create(&self, c: &PendingCreate) -> Result<()> {
        let payload = serde_json::to_string(&c.payload)?;
        self.conn.execute(
            "INSERT INTO pending_creates (local_id, payload, created_at, synced) VALUES (?1, ?2, ?3, ?4)",
            params![c.local_id, payload, c.created_at, c.synced as i32],
        )?;
        Ok(())
    }

    pub fn insert_update(&self, u: &PendingUpdate) -> Result<()> {
        let patch = serde_json::to_string(&u.patch)?;
        self.conn.execute(
            "INSERT INTO pending_updates (id, target_entity_id, patch, created_at, synced) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![u.id, u.target_entity_id, patch, u.created_at, u.synced as i32],
        )?;
        Ok(())
    }

    pub fn insert_delete(&self, d: &PendingDelete) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_deletes (id, target_entity_id, created_at, synced) VALUES (?1, ?2, ?3, ?4)",
            params![d.id, d.target_entity_id, d.created_at, d.synced as i32],
        )?;
        Ok(())
    }

    /// 某一类未同步条目，按插入顺序
    pub fn list_unsynced(&self, kind: PendingKind) -> Result<Vec<PendingMutation>> {
        match kind {
            PendingKind::Create => {
                let mut stmt = self.conn.prepare(
                    "SELECT local_id, payload, created_at, synced FROM pending_creates WHERE synced = 0 ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i32>(3)? != 0,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (local_id, payload, created_at, synced) = row?;
                    out.push(PendingMutation::Create(PendingCreate {
                        local_id,
                        payload: serde_json::from_str(&payload)?,
                        created_at,
                        synced,
                    }));
                }
                Ok(out)
            }
            PendingKind::Update => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, target_entity_id, patch, created_at, synced FROM pending_updates WHERE synced = 0 ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i32>(4)? != 0,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, target_entity_id, patch, created_at, synced) = row?;
                    out.push(PendingMutation::Update(PendingUpdate {
                        id,
                        target_entity_id,
                        patch: serde_json::from_str(&patch)?,
                        created_at,
                        synced,
                    }));
                }
                Ok(out)
            }
            PendingKind::Delete => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, target_entity_id, created_at, synced FROM pending_deletes WHERE synced = 0 ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(PendingMutation::Delete(PendingDelete {
                        id: row.get(0)?,
                        target_entity_id: row.get(1)?,
                        created_at: row.get(2)?,
                        synced: row.get::<_, i32>(3)? != 0,
                    }))
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
        }
    }

    /// 标记已同步；已同步或不存在的条目是 no-op，返回是否真的翻转了一行
    pub fn mark_synced(&self, kind: PendingKind, id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET synced = 1 WHERE {} = ?1 AND synced = 0",
            kind.table_name(),
            kind.id_column()
        );
        let changed = self.conn.execute(&sql, params![id])?;
        Ok(changed > 0)
    }

    /// 删除三张表中所有 synced = 1 的条目（由调用方包事务）
    pub fn purge_synced(&self) -> Result<usize> {
        let mut purged = 0;
        for kind in PendingKind::REPLAY_ORDER {
            purged += self.conn.execute(
                &format!("DELETE FROM {} WHERE synced = 1", kind.table_name()),
                [],
            )?;
        }
        Ok(purged)
    }

    /// 服务端 ID 上是否还有未同步的修改或删除，包括经 ID 映射指向它的临时 ID
    pub fn has_unsynced_for_target(&self, target: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            r#"
            WITH ids(id) AS (
                SELECT ?1
                UNION SELECT local_id FROM local_id_map WHERE server_id = ?1
            )
            SELECT EXISTS (
                SELECT 1 FROM pending_updates
                WHERE synced = 0 AND target_entity_id IN (SELECT id FROM ids)
            ) OR EXISTS (
                SELECT 1 FROM pending_deletes
                WHERE synced = 0 AND target_entity_id IN (SELECT id FROM ids)
            )
            "#,
            params![target],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn count_unsynced(&self) -> Result<PendingCounts> {
        let count = |kind: PendingKind| -> Result<usize> {
            let n: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE synced = 0", kind.table_name()),
                [],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        };
        Ok(PendingCounts {
            create: count(PendingKind::Create)?,
            update: count(PendingKind::Update)?,
            delete: count(PendingKind::Delete)?,
        })
    }

    /// 清空三张日志表（登出时显式调用，由调用方包事务）
    pub fn clear_all(&self) -> Result<()> {
        for kind in PendingKind::REPLAY_ORDER {
            self.conn
                .execute(&format!("DELETE FROM {}", kind.table_name()), [])?;
        }
        Ok(())
    }
}
