//! SDK 版本与构建元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Schema Version** → migrations 目录（文件即版本，由 refinery 管理）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// 构建时间（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前 SDK 支持的最高本地库 schema 版本（refinery_schema_history.version 的上限）。
///
/// 打开本地库时若库内版本高于此值则拒绝打开，避免降级后用旧 schema 读写未同步的数据。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i].is_ascii_digit() {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 用于日志的一行版本描述
pub fn version_line() -> String {
    format!("finsync-sdk {} ({}, built {})", SDK_VERSION, GIT_SHA, BUILD_TIME)
}
