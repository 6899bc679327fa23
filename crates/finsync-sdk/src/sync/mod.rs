/// 离线变更回放
///
/// 职责：
/// - 按 create → update → delete 顺序回放未同步日志
/// - 维护临时 ID 到服务端 ID 的映射，延后指向未同步新建的修改
/// - 回放后刷新权威快照与覆盖层

pub mod sync_engine;

pub use sync_engine::SyncEngine;

use serde::{Deserialize, Serialize};

/// 各类日志本轮成功同步的条数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl SyncedCounts {
    pub fn total(&self) -> usize {
        self.create + self.update + self.delete
    }
}

/// 一轮同步的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// 没有任何错误
    pub success: bool,
    pub synced_counts: SyncedCounts,
    /// 形如 `RemoteOperationFailed: <id> (<operation>): <cause>`
    pub errors: Vec<String>,
    /// 因目标仍是未同步新建（或同一目标前序变更失败）而留到下一轮的条数
    pub deferred: usize,
    /// 在本地直接抵消（新建后又删除）的新建条数
    pub coalesced: usize,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncResult {
    pub fn duration_ms(&self) -> i64 {
        self.finished_at - self.started_at
    }
}
