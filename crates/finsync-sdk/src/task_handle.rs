//! 订阅任务句柄
//!
//! `subscribe_to_summary` / `subscribe_to_connection_state` 返回的句柄，
//! 调用 `cancel()` 或直接 drop 即停止回调。

use tokio::task::JoinHandle;
use tracing::debug;

/// 后台回调任务的句柄，drop 时自动取消
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        debug!("取消订阅任务: {}", self.name);
        self.handle.abort();
    }

    /// 任务已结束（正常退出或被取消）
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            debug!("句柄释放，自动取消订阅任务: {}", self.name);
            self.handle.abort();
        }
    }
}
