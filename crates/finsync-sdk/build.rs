//! 编译期元信息：
//! - vergen 生成 BUILD_TIMESTAMP / GIT_SHA（供 version.rs 使用）
//! - SDK_DB_VERSION：扫描 migrations/ 下 refinery 格式的 V{version}__{name}.sql，取最大版本号

use std::env;
use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

/// 从文件名中解析 refinery 版本号，例如 `V3__add_index.sql` -> 3
fn migration_version(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_prefix('V')?.strip_suffix(".sql")?;
    let (version, _name) = stem.split_once("__")?;
    version.parse::<i64>().ok()
}

fn main() {
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit();

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let migrations_dir = Path::new(&manifest_dir).join("migrations");

    let max_version = fs::read_dir(&migrations_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str().and_then(migration_version))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}
