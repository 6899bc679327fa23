//! 临时 ID 映射 DAO - local_id_map 表

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

pub struct IdMapDao<'a> {
    conn: &'a Connection,
}

impl<'a> IdMapDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 重复写入以最后一次为准
    pub fn upsert(&self, local_id: &str, server_id: &str, created_at: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO local_id_map (local_id, server_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(local_id) DO UPDATE SET server_id = excluded.server_id
            "#,
            params![local_id, server_id, created_at],
        )?;
        Ok(())
    }

    pub fn resolve(&self, local_id: &str) -> Result<Option<String>> {
        let server_id = self
            .conn
            .query_row(
                "SELECT server_id FROM local_id_map WHERE local_id = ?1",
                params![local_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(server_id)
    }

    /// 删除不再被未同步修改 / 删除引用的映射，返回删除条数
    pub fn prune_unreferenced(&self) -> Result<usize> {
        let pruned = self.conn.execute(
            r#"
            DELETE FROM local_id_map
            WHERE local_id NOT IN (SELECT target_entity_id FROM pending_updates WHERE synced = 0)
              AND local_id NOT IN (SELECT target_entity_id FROM pending_deletes WHERE synced = 0)
            "#,
            [],
        )?;
        Ok(pruned)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM local_id_map", [])?;
        Ok(())
    }
}
