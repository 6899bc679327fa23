//! 本地库初始化 - schema 由 refinery 管理
//!
//! - 版本 = migrations/ 下的文件顺序，编译期嵌入。
//! - 统一入口 `init_db`：pragmas → migrate → 版本校验。
//! - 新增 schema 只能追加 V{n}__{name}.sql（新表 / 新索引），不允许破坏性改动。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;

use crate::error::{FinsyncError, Result};
use crate::version::SDK_DB_VERSION;

const REFINERY_TABLE: &str = "refinery_schema_history";

/// WAL + NORMAL：单写者、崩溃安全，队列写入不阻塞缓存读取
const STORE_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(STORE_PRAGMAS.trim())
        .map_err(|e| FinsyncError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

/// 执行内置 migrations（重复执行是 no-op）
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| FinsyncError::Database(format!("执行 migration 失败: {}", e)))?;
    for migration in report.applied_migrations() {
        tracing::info!("已应用 migration: {}", migration);
    }
    Ok(())
}

/// 当前库内 migration 版本；无表或空表返回 None
pub fn db_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| FinsyncError::Database(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| FinsyncError::Database(format!("读取 migration 版本失败: {}", e)))?;

    Ok(version.filter(|&v| v > 0))
}

/// 库版本高于 SDK 支持的版本时拒绝打开（防降级后误写）
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = db_schema_version(conn)? else {
        return Ok(());
    };
    if v > SDK_DB_VERSION {
        return Err(FinsyncError::StorageUnavailable(format!(
            "本地库版本 {} 高于当前 SDK 支持的最高版本 {}",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

/// 统一初始化入口
pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    check_db_version(conn)?;
    run_migrations(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
        rows.collect::<rusqlite::Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_init_db_creates_collections() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "cached_entities",
            "pending_creates",
            "pending_updates",
            "pending_deletes",
            "local_id_map",
        ] {
            assert!(tables.iter().any(|t| t == expected), "缺少表 {}", expected);
        }
        assert_eq!(db_schema_version(&conn).unwrap(), Some(SDK_DB_VERSION));
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        init_db(&mut conn).unwrap();
        assert_eq!(db_schema_version(&conn).unwrap(), Some(SDK_DB_VERSION));
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, applied_on, checksum) VALUES (?1, 'future', '', '0')",
                REFINERY_TABLE
            ),
            [SDK_DB_VERSION + 1],
        )
        .unwrap();

        let err = init_db(&mut conn).unwrap_err();
        assert!(matches!(err, FinsyncError::StorageUnavailable(_)));
    }
}
