//! 网络连通性监控
//!
//! 平台层实现 [`NetworkStatusListener`]，本模块负责维护当前状态并广播变化。
//! 上线后的自动同步由 `FinsyncSDK` 订阅本模块的广播来触发。

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::utils::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限（仍视为在线）
    Limited,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 离线 → 在线
    pub fn came_online(&self) -> bool {
        !self.old_status.is_online() && self.new_status.is_online()
    }
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            forward_task: Mutex::new(None),
        }
    }

    /// 启动网络监控：先用平台层的当前状态初始化，再转发后续变化
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        *self.current_status.write() = initial;
        info!("🌐 网络监控启动, 当前状态: {:?}", initial);

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let old_status = {
                            let mut status = current_status.write();
                            std::mem::replace(&mut *status, event.new_status)
                        };
                        if old_status == event.new_status {
                            continue;
                        }
                        debug!("网络状态变化: {:?} -> {:?}", old_status, event.new_status);
                        let _ = status_sender.send(NetworkStatusEvent {
                            old_status,
                            new_status: event.new_status,
                            timestamp: event.timestamp,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("网络状态事件积压，丢弃 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.forward_task.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// 停止转发任务
    pub async fn stop(&self) {
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
        self.listener.stop_monitoring().await;
    }

    /// 获取当前网络状态
    pub fn get_status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    pub fn is_online(&self) -> bool {
        self.get_status().is_online()
    }

    /// 手动设置网络状态（平台层未接入时或测试中使用）
    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.current_status.write(), new_status);
        if old_status == new_status {
            return;
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.forward_task.get_mut().take() {
            task.abort();
        }
    }
}


#[cfg(test)]
pub use test_helpers::ManualNetworkListener;
