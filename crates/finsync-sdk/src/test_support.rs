//! 测试用的内存后端与推送通道

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FinsyncError, Result};
use crate::realtime::{ChannelMessage, PushChannel, PushChannelProvider};
use crate::remote::{ListFilters, RemoteBackend};
use crate::storage::entities::{NewTransaction, TransactionPatch, TransactionRecord};

/// 测试日志：`RUST_LOG=finsync_sdk=debug cargo test` 时输出，重复调用无副作用
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ========== 推送通道 ==========

#[derive(Debug)]
struct FakeChannel {
    sender: mpsc::Sender<ChannelMessage>,
    shutdown: CancellationToken,
}

/// 每次打开都立即发送 `Subscribed`
#[derive(Debug, Default)]
pub struct FakePushProvider {
    channels: Mutex<HashMap<String, Vec<FakeChannel>>>,
    opens: Mutex<HashMap<String, usize>>,
    fail_opens: AtomicBool,
}

impl FakePushProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self, user_id: &str) -> usize {
        self.opens.lock().get(user_id).copied().unwrap_or(0)
    }

    /// 订阅方尚未关闭的通道数
    pub fn live_channels(&self, user_id: &str) -> usize {
        self.channels
            .lock()
            .get(user_id)
            .map(|list| list.iter().filter(|c| !c.shutdown.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// 向该用户最新的存活通道投递一条消息
    pub async fn push(&self, user_id: &str, message: ChannelMessage) {
        let sender = self.channels.lock().get(user_id).and_then(|list| {
            list.iter()
                .rev()
                .find(|c| !c.shutdown.is_cancelled())
                .map(|c| c.sender.clone())
        });
        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }
    }
}

#[async_trait]
impl PushChannelProvider for FakePushProvider {
    async fn open_channel(&self, user_id: &str) -> Result<PushChannel> {
        *self.opens.lock().entry(user_id.to_string()).or_insert(0) += 1;
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(FinsyncError::ChannelError("connection refused".to_string()));
        }

        let (sender, events) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let _ = sender.try_send(ChannelMessage::Subscribed);
        self.channels
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .push(FakeChannel {
                sender,
                shutdown: shutdown.clone(),
            });
        Ok(PushChannel { events, shutdown })
    }
}

// ========== 远端后端 ==========

/// 后端收到的一次调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub operation: &'static str,
    pub id: String,
}

#[derive(Debug, Default)]
struct FakeRemoteState {
    /// 最新的在前
    records: Vec<TransactionRecord>,
    idempotency: HashMap<String, String>,
    calls: Vec<RemoteCall>,
    failures: HashSet<(String, String)>,
}

/// 内存后端：按幂等键去重，支持离线、按 (操作, ID) 注入失败和丢失响应
#[derive(Debug, Default)]
pub struct FakeRemoteBackend {
    state: Mutex<FakeRemoteState>,
    offline: AtomicBool,
    lose_responses: AtomicBool,
    next_id: AtomicU64,
    delay_ms: AtomicU64,
}

impl FakeRemoteBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 操作在服务端生效，但响应丢失（客户端看到传输错误）
    pub fn lose_responses(&self, lose: bool) {
        self.lose_responses.store(lose, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// `operation` 取 create / update / delete / list；create 的 id 为幂等键
    pub fn fail_on(&self, operation: &str, id: &str) {
        self.state
            .lock()
            .failures
            .insert((operation.to_string(), id.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn seed(&self, record: TransactionRecord) {
        self.state.lock().records.insert(0, record);
    }

    pub fn records(&self) -> Vec<TransactionRecord> {
        self.state.lock().records.clone()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    async fn enter(&self, operation: &'static str, id: &str) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut state = self.state.lock();
        state.calls.push(RemoteCall {
            operation,
            id: id.to_string(),
        });
        if self.offline.load(Ordering::SeqCst) {
            return Err(FinsyncError::Transport("network unreachable".to_string()));
        }
        if state
            .failures
            .contains(&(operation.to_string(), id.to_string()))
        {
            return Err(FinsyncError::Transport(format!(
                "injected {} failure",
                operation
            )));
        }
        Ok(())
    }

    fn respond<T>(&self, value: T) -> Result<T> {
        if self.lose_responses.load(Ordering::SeqCst) {
            return Err(FinsyncError::Transport("connection reset".to_string()));
        }
        Ok(value)
    }
}

#[async_trait]
impl RemoteBackend for FakeRemoteBackend {
    async fn create_entity(
        &self,
        payload: &NewTransaction,
        idempotency_key: &str,
    ) -> Result<TransactionRecord> {
        self.enter("create", idempotency_key).await?;
        let record = {
            let mut state = self.state.lock();
            let existing = state
                .idempotency
                .get(idempotency_key)
                .and_then(|server_id| state.records.iter().find(|r| &r.id == server_id))
                .cloned();
            match existing {
                Some(record) => record,
                None => {
                    let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let record = payload.to_record(&format!("srv-{}", n), None);
                    state
                        .idempotency
                        .insert(idempotency_key.to_string(), record.id.clone());
                    state.records.insert(0, record.clone());
                    record
                }
            }
        };
        self.respond(record)
    }

    async fn update_entity(&self, id: &str, patch: &TransactionPatch) -> Result<TransactionRecord> {
        self.enter("update", id).await?;
        let updated = {
            let mut state = self.state.lock();
            let slot = state
                .records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| FinsyncError::Server {
                    status: 404,
                    message: format!("transaction {} not found", id),
                })?;
            *slot = patch.apply_to(slot);
            slot.clone()
        };
        self.respond(updated)
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        self.enter("delete", id).await?;
        self.state.lock().records.retain(|r| r.id != id);
        self.respond(())
    }

    async fn list_entities(&self, filters: &ListFilters) -> Result<Vec<TransactionRecord>> {
        self.enter("list", "").await?;
        let records = self
            .state
            .lock()
            .records
            .iter()
            .filter(|r| filters.kind.map_or(true, |k| r.kind == k))
            .filter(|r| filters.category.as_ref().map_or(true, |c| &r.category == c))
            .cloned()
            .collect();
        Ok(records)
    }
}
