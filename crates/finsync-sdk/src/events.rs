//! 事件系统模块 - 对外广播 SDK 内部状态变化
//!
//! 功能包括：
//! - 同步开始 / 完成事件
//! - 变更入队与待同步数量变化
//! - 网络与推送通道状态变化
//! - 推送事件已应用
//!
//! 汇总数据不走事件通道，见 `OptimisticOverlay::subscribe_summary`。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::network::NetworkStatus;
use crate::realtime::ConnectionState;
use crate::storage::entities::{PendingCounts, PendingKind};
use crate::sync::SyncResult;
use crate::utils::now_millis;

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 一轮同步开始
    SyncStarted { timestamp: i64 },
    /// 一轮同步结束
    SyncCompleted { result: SyncResult, timestamp: i64 },
    /// 一条变更因离线或远端失败进入本地队列
    MutationQueued {
        kind: PendingKind,
        entity_id: String,
        timestamp: i64,
    },
    /// 未同步数量变化
    PendingOperationsChanged { counts: PendingCounts, timestamp: i64 },
    /// 网络状态变化
    NetworkStatusChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: i64,
    },
    /// 推送通道状态变化
    ConnectionStateChanged { state: ConnectionState, timestamp: i64 },
    /// 一条推送事件已对账完成
    RealtimeEventApplied {
        entity_id: String,
        change: String,
        timestamp: i64,
    },
}

impl SDKEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::SyncStarted { .. } => "sync_started",
            SDKEvent::SyncCompleted { .. } => "sync_completed",
            SDKEvent::MutationQueued { .. } => "mutation_queued",
            SDKEvent::PendingOperationsChanged { .. } => "pending_operations_changed",
            SDKEvent::NetworkStatusChanged { .. } => "network_status_changed",
            SDKEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SDKEvent::RealtimeEventApplied { .. } => "realtime_event_applied",
        }
    }
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件
    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn sync_started() -> SDKEvent {
        SDKEvent::SyncStarted {
            timestamp: now_millis(),
        }
    }

    pub fn sync_completed(result: SyncResult) -> SDKEvent {
        SDKEvent::SyncCompleted {
            result,
            timestamp: now_millis(),
        }
    }

    pub fn mutation_queued(kind: PendingKind, entity_id: &str) -> SDKEvent {
        SDKEvent::MutationQueued {
            kind,
            entity_id: entity_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn pending_operations_changed(counts: PendingCounts) -> SDKEvent {
        SDKEvent::PendingOperationsChanged {
            counts,
            timestamp: now_millis(),
        }
    }

    pub fn network_status_changed(old_status: NetworkStatus, new_status: NetworkStatus) -> SDKEvent {
        SDKEvent::NetworkStatusChanged {
            old_status,
            new_status,
            timestamp: now_millis(),
        }
    }

    pub fn connection_state_changed(state: ConnectionState) -> SDKEvent {
        SDKEvent::ConnectionStateChanged {
            state,
            timestamp: now_millis(),
        }
    }

    pub fn realtime_event_applied(entity_id: &str, change: &str) -> SDKEvent {
        SDKEvent::RealtimeEventApplied {
            entity_id: entity_id.to_string(),
            change: change.to_string(),
            timestamp: now_millis(),
        }
    }
}
