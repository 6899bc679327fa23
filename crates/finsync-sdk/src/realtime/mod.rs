//! 实时对账 - 推送通道订阅、连接状态机与事件对账
//!
//! 每个订阅两个任务：
//! - 连接任务：维护通道与重连状态机，把权威事件投递到队列
//! - 对账任务：按顺序消费队列，退役覆盖层条目并刷新权威视图
//!
//! 同一用户同时最多一个活跃通道。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::storage::entities::TransactionRecord;

pub mod backoff;
pub mod connection_state;
pub mod listener;
pub mod reconciler;

pub use backoff::{ReconnectBackoff, ReconnectConfig};
pub use connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
pub use listener::{RealtimeListener, Subscription};
pub use reconciler::Reconciler;

/// 后端推送的权威变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RealtimeEvent {
    Insert(TransactionRecord),
    Update(TransactionRecord),
    Delete { id: String },
}

impl RealtimeEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            RealtimeEvent::Insert(record) | RealtimeEvent::Update(record) => &record.id,
            RealtimeEvent::Delete { id } => id,
        }
    }

    pub fn change_name(&self) -> &'static str {
        match self {
            RealtimeEvent::Insert(_) => "insert",
            RealtimeEvent::Update(_) => "update",
            RealtimeEvent::Delete { .. } => "delete",
        }
    }
}

/// 推送通道上的一条消息
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// 订阅已建立
    Subscribed,
    Event(RealtimeEvent),
    /// 通道出错，连接任务会进入重连
    Error(String),
    /// 对端关闭
    Closed,
}

/// 一条已打开的推送通道
///
/// `shutdown` 由订阅方取消，提供方据此关闭底层连接。
#[derive(Debug)]
pub struct PushChannel {
    pub events: mpsc::Receiver<ChannelMessage>,
    pub shutdown: CancellationToken,
}

/// 推送通道提供方（WebSocket / SSE 等由平台层实现）
#[async_trait]
pub trait PushChannelProvider: Send + Sync + std::fmt::Debug {
    /// 打开一条只包含该用户记录的通道
    async fn open_channel(&self, user_id: &str) -> Result<PushChannel>;
}

/// 订阅方回调；默认全部为空实现
pub trait RealtimeHandler: Send + Sync {
    fn on_insert(&self, _record: &TransactionRecord) {}

    fn on_update(&self, _record: &TransactionRecord) {}

    fn on_delete(&self, _id: &str) {}

    fn on_connection_state_change(&self, _state: &ConnectionState) {}
}

/// 不关心回调时使用
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRealtimeHandler;

impl RealtimeHandler for NoopRealtimeHandler {}
