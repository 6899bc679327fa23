//! 推送通道连接状态
//!
//! 状态机：Disconnected → Connecting → Connected →（出错/断开）→ Reconnecting
//! → Connected | Failed。每次变化都经 `watch` 广播给所有订阅者。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::utils::{elapsed_secs_since, millis_to_datetime, now_millis};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 重连中
    Reconnecting,
    /// 连接失败（重连次数耗尽）
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
            ConnectionStatus::Failed => write!(f, "连接失败"),
        }
    }
}

/// 推送通道连接状态（对外快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    pub is_connecting: bool,
    /// 最近一次错误；重新连上后清空
    pub error: Option<String>,
    /// 最近一次连上的时间（UTC毫秒时间戳）
    pub last_connected: Option<i64>,
    pub reconnect_attempts: u32,
    pub user_id: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            is_connected: false,
            is_connecting: false,
            error: None,
            last_connected: None,
            reconnect_attempts: 0,
            user_id: None,
        }
    }
}

impl ConnectionState {
    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        let last_connected = self
            .last_connected
            .and_then(|ms| millis_to_datetime(ms).map(|dt| (dt, elapsed_secs_since(ms))))
            .map(|(dt, secs)| format!("{} ({}秒前)", dt.to_rfc3339(), secs))
            .unwrap_or_else(|| "从未".to_string());
        format!(
            "【推送通道】状态: {}, 用户: {}, 上次连接: {}, 重连次数: {}, 错误: {}",
            self.status,
            self.user_id.as_deref().unwrap_or("-"),
            last_connected,
            self.reconnect_attempts,
            self.error.as_deref().unwrap_or("无")
        )
    }
}

/// 连接状态管理器
///
/// 写入方只有连接任务；`subscribe()` 可以有任意多个读者。
#[derive(Debug, Clone)]
pub struct ConnectionStateManager {
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateManager {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            state: Arc::new(state),
        }
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionState)) {
        self.state.send_modify(|state| {
            f(state);
            state.is_connected = state.status == ConnectionStatus::Connected;
            state.is_connecting = matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            );
        });
    }

    /// 开始一次新的订阅：重置计数与错误
    pub fn begin_session(&self, user_id: &str) {
        self.update(|s| {
            s.status = ConnectionStatus::Connecting;
            s.user_id = Some(user_id.to_string());
            s.reconnect_attempts = 0;
            s.error = None;
        });
    }

    /// 连上后错误与重连计数清零
    pub fn mark_connected(&self) {
        self.update(|s| {
            s.status = ConnectionStatus::Connected;
            s.last_connected = Some(now_millis());
            s.error = None;
            s.reconnect_attempts = 0;
        });
    }

    pub fn mark_reconnecting(&self, attempt: u32, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| {
            s.status = ConnectionStatus::Reconnecting;
            s.reconnect_attempts = attempt;
            s.error = Some(error);
        });
    }

    pub fn mark_failed(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| {
            s.status = ConnectionStatus::Failed;
            s.error = Some(error);
        });
    }

    /// 主动取消订阅
    pub fn mark_disconnected(&self) {
        self.update(|s| s.status = ConnectionStatus::Disconnected);
    }

    /// 会话结束：回到初始状态
    pub fn end_session(&self) {
        self.state.send_replace(ConnectionState::default());
    }

    /// 获取当前状态快照
    pub fn get_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 打印状态到日志
    pub fn log_state(&self) {
        tracing::info!("{}", self.state.borrow().summary());
    }
}
