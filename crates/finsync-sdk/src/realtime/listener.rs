//! 推送通道订阅管理

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FinsyncError, Result};
use crate::realtime::{
    ChannelMessage, ConnectionState, ConnectionStateManager, PushChannelProvider,
    RealtimeEvent, RealtimeHandler, Reconciler, ReconnectBackoff, ReconnectConfig,
};

/// 连接任务与对账任务之间的队列长度
const EVENT_QUEUE_CAPACITY: usize = 256;

struct ActiveSubscription {
    generation: u64,
    cancel: CancellationToken,
    connection_task: JoinHandle<()>,
    reconciler_task: JoinHandle<()>,
}

impl ActiveSubscription {
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.connection_task.await;
        let _ = self.reconciler_task.await;
    }
}

struct ListenerInner {
    provider: Arc<dyn PushChannelProvider>,
    reconciler: Reconciler,
    state: ConnectionStateManager,
    reconnect_config: ReconnectConfig,
    active: Mutex<HashMap<String, ActiveSubscription>>,
    next_generation: AtomicU64,
}

/// 实时监听器
#[derive(Clone)]
pub struct RealtimeListener {
    inner: Arc<ListenerInner>,
}

impl std::fmt::Debug for RealtimeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeListener")
            .field("state", &self.inner.state.get_state())
            .finish()
    }
}

impl RealtimeListener {
    pub fn new(
        provider: Arc<dyn PushChannelProvider>,
        reconciler: Reconciler,
        state: ConnectionStateManager,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                provider,
                reconciler,
                state,
                reconnect_config,
                active: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.get_state()
    }

    pub fn state_manager(&self) -> &ConnectionStateManager {
        &self.inner.state
    }

    /// 订阅某个用户的推送；已有订阅会先被拆除并等待其任务退出
    pub async fn subscribe(
        &self,
        user_id: &str,
        handler: Arc<dyn RealtimeHandler>,
    ) -> Result<Subscription> {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.remove(user_id) {
            info!("🔁 拆除旧的推送订阅: user={}", user_id);
            previous.shutdown().await;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        self.inner.state.begin_session(user_id);
        handler.on_connection_state_change(&self.inner.state.get_state());

        let connection_task = tokio::spawn(run_connection(
            self.inner.provider.clone(),
            user_id.to_string(),
            queue_tx,
            self.inner.state.clone(),
            ReconnectBackoff::new(self.inner.reconnect_config.clone()),
            handler.clone(),
            cancel.clone(),
        ));
        let reconciler_task = tokio::spawn(run_reconciler(
            self.inner.reconciler.clone(),
            queue_rx,
            handler,
            cancel.clone(),
        ));

        active.insert(
            user_id.to_string(),
            ActiveSubscription {
                generation,
                cancel: cancel.clone(),
                connection_task,
                reconciler_task,
            },
        );
        info!("📡 推送订阅已建立: user={}, generation={}", user_id, generation);

        Ok(Subscription {
            user_id: user_id.to_string(),
            generation,
            cancel,
            listener: self.clone(),
        })
    }

    /// 拆除并重新建立订阅，重连计数归零
    pub async fn reconnect(
        &self,
        user_id: &str,
        handler: Arc<dyn RealtimeHandler>,
    ) -> Result<Subscription> {
        info!("手动重连推送通道: user={}", user_id);
        self.subscribe(user_id, handler).await
    }

    /// 拆除某个用户的订阅（不存在时 no-op）
    pub async fn unsubscribe_user(&self, user_id: &str) {
        let previous = self.inner.active.lock().await.remove(user_id);
        if let Some(previous) = previous {
            previous.shutdown().await;
            self.inner.state.mark_disconnected();
            debug!("推送订阅已取消: user={}", user_id);
        }
    }

    /// 拆除全部订阅（会话结束）
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.inner.active.lock().await.drain().collect();
        for (_, subscription) in drained {
            subscription.shutdown().await;
        }
        self.inner.state.end_session();
    }

    pub async fn is_subscribed(&self, user_id: &str) -> bool {
        self.inner.active.lock().await.contains_key(user_id)
    }

    /// 只拆除同一代的订阅，避免旧句柄误伤新订阅
    async fn teardown_generation(&self, user_id: &str, generation: u64) {
        let previous = {
            let mut active = self.inner.active.lock().await;
            match active.get(user_id) {
                Some(sub) if sub.generation == generation => active.remove(user_id),
                _ => None,
            }
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
            self.inner.state.mark_disconnected();
            debug!("推送订阅已取消: user={}", user_id);
        }
    }
}

/// 订阅句柄；drop 时取消订阅任务
pub struct Subscription {
    user_id: String,
    generation: u64,
    cancel: CancellationToken,
    listener: RealtimeListener,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("user_id", &self.user_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Subscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// 取消订阅并等待两个任务退出
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        self.listener
            .teardown_generation(&self.user_id, self.generation)
            .await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum ChannelOutcome {
    Cancelled,
    Dropped(String),
}

/// 连接状态机
async fn run_connection(
    provider: Arc<dyn PushChannelProvider>,
    user_id: String,
    queue: mpsc::Sender<RealtimeEvent>,
    state: ConnectionStateManager,
    mut backoff: ReconnectBackoff,
    handler: Arc<dyn RealtimeHandler>,
    cancel: CancellationToken,
) {
    let notify = |state: &ConnectionStateManager| {
        let snapshot = state.get_state();
        handler.on_connection_state_change(&snapshot);
    };

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = provider.open_channel(&user_id) => opened,
        };

        let reason = match opened {
            Ok(mut channel) => {
                let outcome = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break ChannelOutcome::Cancelled,
                        message = channel.events.recv() => match message {
                            Some(ChannelMessage::Subscribed) => {
                                backoff.reset();
                                state.mark_connected();
                                notify(&state);
                                info!("✅ 推送通道已连接: user={}", user_id);
                            }
                            Some(ChannelMessage::Event(event)) => {
                                if queue.send(event).await.is_err() {
                                    break ChannelOutcome::Cancelled;
                                }
                            }
                            Some(ChannelMessage::Error(e)) => break ChannelOutcome::Dropped(e),
                            Some(ChannelMessage::Closed) | None => {
                                break ChannelOutcome::Dropped("推送通道已关闭".to_string())
                            }
                        },
                    }
                };
                channel.shutdown.cancel();
                match outcome {
                    ChannelOutcome::Cancelled => break,
                    ChannelOutcome::Dropped(reason) => FinsyncError::ChannelError(reason),
                }
            }
            Err(e @ FinsyncError::ChannelError(_)) => e,
            Err(e) => FinsyncError::ChannelError(format!("打开推送通道失败: {}", e)),
        };

        match backoff.next_delay() {
            Some(delay) => {
                warn!(
                    "推送通道断开，{}ms 后第 {} 次重连: user={}, reason={}",
                    delay.as_millis(),
                    backoff.attempts(),
                    user_id,
                    reason
                );
                state.mark_reconnecting(backoff.attempts(), reason.to_string());
                notify(&state);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                warn!("❌ 推送通道重连次数耗尽: user={}, reason={}", user_id, reason);
                state.mark_failed(reason.to_string());
                state.log_state();
                notify(&state);
                break;
            }
        }
    }
    debug!("连接任务退出: user={}", user_id);
}

/// 按顺序消费队列，保证同一时刻只有一个对账在修改覆盖层
async fn run_reconciler(
    reconciler: Reconciler,
    mut queue: mpsc::Receiver<RealtimeEvent>,
    handler: Arc<dyn RealtimeHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = queue.recv() => match event {
                Some(event) => reconciler.apply(&event, handler.as_ref()).await,
                None => break,
            },
        }
    }
}
