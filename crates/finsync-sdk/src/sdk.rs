//! 统一 SDK 接口 - FinsyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! FinsyncSDK (会话门面)
//!   ├── LocalStore (本地持久化，按用户)
//!   ├── SyncEngine (离线变更回放，按用户)
//!   ├── RealtimeListener (推送对账，按用户)
//!   ├── OptimisticOverlay (乐观覆盖层 + 汇总)
//!   ├── EventManager (事件系统)
//!   └── NetworkMonitor (网络监控)
//! ```
//!
//! 进程内构造一次；`init_session(user_id)` / `teardown()` 管理每个用户的
//! 存储、同步引擎和推送订阅。切换账号即 teardown 后再 init。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FinsyncError, Result};
use crate::events::{event_builders, EventManager, SDKEvent};
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
use crate::overlay::OptimisticOverlay;
use crate::realtime::{
    ConnectionState, ConnectionStateManager, NoopRealtimeHandler, PushChannelProvider,
    RealtimeEvent, RealtimeHandler, RealtimeListener, Reconciler, ReconnectConfig, Subscription,
};
use crate::remote::{HttpRemoteBackend, ListFilters, RemoteBackend};
use crate::storage::entities::{
    is_local_id, new_local_id, NewTransaction, PendingCounts, PendingKind, PendingMutation,
    TransactionPatch, TransactionRecord,
};
use crate::storage::LocalStore;
use crate::summary::{FinancialSummaryCalculator, Summary, SummaryCalculator};
use crate::sync::{SyncEngine, SyncResult};
use crate::task_handle::TaskHandle;

/// 默认网络状态监听器（假设网络始终在线）
/// 实际应用应该由平台层提供真实的网络状态监听
#[derive(Debug)]
struct DefaultNetworkStatusListener {
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl Default for DefaultNetworkStatusListener {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }
}

#[async_trait]
impl NetworkStatusListener for DefaultNetworkStatusListener {
    async fn get_current_status(&self) -> NetworkStatus {
        NetworkStatus::Online
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 网络恢复且有待同步变更时自动同步
    pub auto_sync_on_reconnect: bool,
    /// 刷新快照时的列表条件
    pub list_filters: ListFilters,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_on_reconnect: true,
            list_filters: ListFilters::default(),
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// Finsync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinsyncConfig {
    /// 数据存储目录，按用户分子目录
    pub data_dir: PathBuf,
    /// REST 后端地址；未注入自定义后端时必填
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub http_client_config: HttpClientConfig,
    /// 推送通道重连策略
    pub reconnect_config: ReconnectConfig,
    pub sync_config: SyncConfig,
    pub event_config: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for FinsyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: None,
            api_token: None,
            http_client_config: HttpClientConfig::default(),
            reconnect_config: ReconnectConfig::default(),
            sync_config: SyncConfig::default(),
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.finsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".finsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".finsync")
    } else {
        PathBuf::from("./finsync_data")
    }
}

/// Finsync SDK 配置构建器
#[derive(Debug, Default)]
pub struct FinsyncConfigBuilder {
    config: FinsyncConfig,
}

impl FinsyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = Some(url.into());
        self
    }

    pub fn api_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.api_token = Some(token.into());
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect_config = config;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config.sync_config = config;
        self
    }

    pub fn auto_sync_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.sync_config.auto_sync_on_reconnect = enabled;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> FinsyncConfig {
        self.config
    }
}

impl FinsyncConfig {
    pub fn builder() -> FinsyncConfigBuilder {
        FinsyncConfigBuilder::new()
    }
}

/// 平台层注入的外部协作方
#[derive(Debug)]
pub struct Collaborators {
    push: Arc<dyn PushChannelProvider>,
    remote: Option<Arc<dyn RemoteBackend>>,
    network: Option<Arc<dyn NetworkStatusListener>>,
    calculator: Option<Arc<dyn SummaryCalculator>>,
}

impl Collaborators {
    pub fn new(push: Arc<dyn PushChannelProvider>) -> Self {
        Self {
            push,
            remote: None,
            network: None,
            calculator: None,
        }
    }

    /// 自定义后端；未设置时按配置创建 `HttpRemoteBackend`
    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// 平台网络监听；未设置时视为始终在线
    pub fn with_network_listener(mut self, listener: Arc<dyn NetworkStatusListener>) -> Self {
        self.network = Some(listener);
        self
    }

    pub fn with_calculator(mut self, calculator: Arc<dyn SummaryCalculator>) -> Self {
        self.calculator = Some(calculator);
        self
    }
}

/// 一个用户会话持有的对象
struct Session {
    user_id: String,
    /// 每次 init 递增；远端调用返回后据此判断会话是否已切换
    generation: u64,
    store: LocalStore,
    engine: Arc<SyncEngine>,
    listener: RealtimeListener,
    handler: Arc<dyn RealtimeHandler>,
    subscription: Option<Subscription>,
}

/// 统一 SDK 主接口
pub struct FinsyncSDK {
    config: FinsyncConfig,
    remote: Arc<dyn RemoteBackend>,
    push: Arc<dyn PushChannelProvider>,
    network: Arc<NetworkMonitor>,
    event_manager: Arc<EventManager>,

    /// 跨会话共享，订阅方在切换账号后继续收到新会话的数据
    overlay: OptimisticOverlay,
    connection_state: ConnectionStateManager,

    session: RwLock<Option<Session>>,
    session_generation: AtomicU64,

    /// 后台转发任务（网络变化 / 连接状态）
    background_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FinsyncSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinsyncSDK")
            .field("data_dir", &self.config.data_dir)
            .field("network", &self.network.get_status())
            .field("connection", &self.connection_state.get_state().status)
            .finish()
    }
}

impl FinsyncSDK {
    /// 初始化 SDK
    ///
    /// 初始化顺序：远端后端 → 网络监控 → 事件 → 覆盖层 → 后台任务
    pub async fn initialize(config: FinsyncConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        info!("正在初始化 FinsyncSDK...");
        Self::validate_config(&config, collaborators.remote.is_some())?;

        let remote: Arc<dyn RemoteBackend> = match collaborators.remote {
            Some(remote) => remote,
            None => {
                let base_url = config.api_base_url.clone().unwrap_or_default();
                Arc::new(HttpRemoteBackend::new(
                    &config.http_client_config,
                    base_url,
                    config.api_token.clone(),
                )?)
            }
        };

        let network_listener = collaborators
            .network
            .unwrap_or_else(|| Arc::new(DefaultNetworkStatusListener::default()));
        let network = Arc::new(NetworkMonitor::new(network_listener));

        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));

        let calculator = collaborators
            .calculator
            .unwrap_or_else(|| Arc::new(FinancialSummaryCalculator));
        let overlay = OptimisticOverlay::new(calculator);

        let sdk = Arc::new(Self {
            config,
            remote,
            push: collaborators.push,
            network: network.clone(),
            event_manager,
            overlay,
            connection_state: ConnectionStateManager::new(),
            session: RwLock::new(None),
            session_generation: AtomicU64::new(0),
            background_tasks: parking_lot::Mutex::new(Vec::new()),
        });

        // 先订阅再启动，避免漏掉启动后的第一次变化
        let network_task = tokio::spawn(run_network_watcher(
            Arc::downgrade(&sdk),
            network.subscribe(),
        ));
        let state_task = tokio::spawn(run_connection_state_forwarder(
            sdk.event_manager.clone(),
            sdk.connection_state.clone(),
        ));
        sdk.background_tasks.lock().extend([network_task, state_task]);

        network.start().await?;

        info!("✅ FinsyncSDK 初始化完成");
        Ok(sdk)
    }

    /// 验证配置
    fn validate_config(config: &FinsyncConfig, has_custom_remote: bool) -> Result<()> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(FinsyncError::Config("数据目录不能为空".to_string()));
        }

        if !has_custom_remote
            && config
                .api_base_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(FinsyncError::Config(
                "未注入后端时必须配置 api_base_url".to_string(),
            ));
        }

        if config.reconnect_config.backoff_multiplier < 1.0 {
            return Err(FinsyncError::Config("backoff_multiplier 不能小于 1".to_string()));
        }

        Ok(())
    }

    pub fn config(&self) -> &FinsyncConfig {
        &self.config
    }

    // ========== 会话生命周期 ==========

    /// 打开用户会话；同一用户重复调用直接返回
    pub async fn init_session(&self, user_id: &str) -> Result<()> {
        self.init_session_with_handler(user_id, Arc::new(NoopRealtimeHandler))
            .await
    }

    /// 打开用户会话，并把推送回调交给 `handler`
    pub async fn init_session_with_handler(
        &self,
        user_id: &str,
        handler: Arc<dyn RealtimeHandler>,
    ) -> Result<()> {
        {
            let session = self.session.read().await;
            if session.as_ref().map(|s| s.user_id.as_str()) == Some(user_id) {
                debug!("会话已存在，跳过: user={}", user_id);
                return Ok(());
            }
        }
        self.teardown().await;

        info!("🔑 打开用户会话: user={}", user_id);
        let store = LocalStore::open(&self.config.data_dir, user_id).await?;
        self.restore_overlay(&store).await?;

        let engine = Arc::new(
            SyncEngine::new(store.clone(), self.remote.clone(), self.overlay.clone())
                .with_events(self.event_manager.clone())
                .with_filters(self.config.sync_config.list_filters.clone()),
        );

        let reconciler = Reconciler::new(store.clone(), self.overlay.clone())
            .with_events(self.event_manager.clone());
        let listener = RealtimeListener::new(
            self.push.clone(),
            reconciler,
            self.connection_state.clone(),
            self.config.reconnect_config.clone(),
        );
        let subscription = listener.subscribe(user_id, handler.clone()).await?;

        let counts = store.pending_count().await?;
        *self.session.write().await = Some(Session {
            user_id: user_id.to_string(),
            generation: self.session_generation.fetch_add(1, Ordering::SeqCst) + 1,
            store,
            engine,
            listener,
            handler,
            subscription: Some(subscription),
        });

        self.event_manager
            .emit(event_builders::pending_operations_changed(counts))
            .await;
        info!(
            "✅ 会话就绪: user={}, 待同步 {} 条",
            user_id,
            counts.total()
        );
        Ok(())
    }

    /// 从本地快照与未同步日志恢复覆盖层
    async fn restore_overlay(&self, store: &LocalStore) -> Result<()> {
        self.overlay.reset();
        self.overlay.set_authoritative(store.read_cache().await?);

        let mut creates = Vec::new();
        for mutation in store.list_pending(PendingKind::Create).await? {
            if let PendingMutation::Create(create) = mutation {
                creates.push(create);
            }
        }
        let mut updates = Vec::new();
        for mutation in store.list_pending(PendingKind::Update).await? {
            if let PendingMutation::Update(mut update) = mutation {
                update.target_entity_id = resolve_key(store, &update.target_entity_id).await?;
                updates.push(update);
            }
        }
        let mut deletes = Vec::new();
        for mutation in store.list_pending(PendingKind::Delete).await? {
            if let PendingMutation::Delete(mut delete) = mutation {
                delete.target_entity_id = resolve_key(store, &delete.target_entity_id).await?;
                deletes.push(delete);
            }
        }

        self.overlay.rebuild_from_pending(&creates, &updates, &deletes);
        Ok(())
    }

    /// 结束当前会话：取消推送订阅、关闭本地库、清空覆盖层。未同步日志保留在磁盘上。
    pub async fn teardown(&self) {
        let session = self.session.write().await.take();
        let Some(session) = session else {
            return;
        };

        if let Some(subscription) = session.subscription {
            subscription.unsubscribe().await;
        }
        session.listener.shutdown().await;
        if let Err(e) = session.store.close().await {
            warn!("关闭本地存储失败: user={}, error={}", session.user_id, e);
        }
        self.overlay.reset();
        info!("会话已结束: user={}", session.user_id);
    }

    /// 登出：清空当前用户的本地数据（包括未同步日志）后结束会话
    pub async fn logout(&self) -> Result<()> {
        let store = self.active_store().await?;
        store.clear_all().await?;
        self.teardown().await;
        Ok(())
    }

    /// 关闭 SDK
    pub async fn shutdown(&self) {
        self.teardown().await;
        self.network.stop().await;
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        info!("FinsyncSDK 已关闭");
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.user_id.clone())
    }

    async fn active_store(&self) -> Result<LocalStore> {
        Ok(self.active_session().await?.0)
    }

    /// 当前会话的存储与代数
    async fn active_session(&self) -> Result<(LocalStore, u64)> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| (s.store.clone(), s.generation))
            .ok_or_else(|| FinsyncError::NotInitialized("尚未调用 init_session".to_string()))
    }

    /// 仍是 `generation` 那个会话时返回读锁；持有期间 teardown 会等待
    async fn session_if_current(
        &self,
        generation: u64,
    ) -> Option<RwLockReadGuard<'_, Option<Session>>> {
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(s) if s.generation == generation => Some(guard),
            _ => None,
        }
    }

    async fn active_engine(&self) -> Result<Arc<SyncEngine>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.engine.clone())
            .ok_or_else(|| FinsyncError::NotInitialized("尚未调用 init_session".to_string()))
    }

    // ========== 变更 ==========

    /// 新建交易：在线时直连后端，失败或离线时入队并乐观展示
    pub async fn create_transaction(&self, payload: NewTransaction) -> Result<TransactionRecord> {
        let (store, generation) = self.active_session().await?;
        // 直连与入队使用同一个临时 ID，直连响应丢失后重放也能被后端去重
        let local_id = new_local_id();

        if self.network.is_online() {
            match self.remote.create_entity(&payload, &local_id).await {
                Ok(record) => {
                    debug!("直连新建成功: id={}", record.id);
                    self.apply_direct(&store, generation, RealtimeEvent::Insert(record.clone()))
                        .await;
                    return Ok(record);
                }
                Err(e) if e.is_retryable() => {
                    warn!("直连新建失败，转入离线队列: {}", e);
                }
                Err(e) => return Err(FinsyncError::remote("create", &local_id, e)),
            }
        }

        let record = {
            let _session = self
                .session_if_current(generation)
                .await
                .ok_or_else(session_switched)?;
            let local_id = store.enqueue_create_as(local_id, payload.clone()).await?;
            let record = payload.to_record(&local_id, None);
            self.overlay.add_optimistic(record.clone());
            record
        };
        self.after_queued(&store, PendingKind::Create, &record.id).await;
        Ok(record)
    }

    /// 部分更新；`id` 可以是服务端 ID 或未同步新建的临时 ID
    pub async fn update_transaction(
        &self,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<TransactionRecord> {
        if patch.is_empty() {
            return Err(FinsyncError::InvalidArgument("更新内容为空".to_string()));
        }
        let (store, generation) = self.active_session().await?;
        let target = resolve_key(&store, id).await?;
        let current = self
            .find_visible(&target)
            .ok_or_else(|| FinsyncError::NotFound(format!("交易不存在: {}", id)))?;

        if self.can_call_directly(&store, &target).await? {
            match self.remote.update_entity(&target, &patch).await {
                Ok(record) => {
                    self.apply_direct(&store, generation, RealtimeEvent::Update(record.clone()))
                        .await;
                    return Ok(record);
                }
                Err(e) if e.is_retryable() => {
                    warn!("直连更新失败，转入离线队列: id={}, error={}", target, e);
                }
                Err(e) => return Err(FinsyncError::remote("update", &target, e)),
            }
        }

        let record = {
            let _session = self
                .session_if_current(generation)
                .await
                .ok_or_else(session_switched)?;
            store.enqueue_update(&target, patch.clone()).await?;
            self.overlay
                .apply_patch_optimistic(&target, &patch)
                .unwrap_or_else(|| patch.apply_to(&current))
        };
        self.after_queued(&store, PendingKind::Update, &target).await;
        Ok(record)
    }

    /// 删除；`id` 可以是服务端 ID 或未同步新建的临时 ID
    pub async fn delete_transaction(&self, id: &str) -> Result<()> {
        let (store, generation) = self.active_session().await?;
        let target = resolve_key(&store, id).await?;
        if self.find_visible(&target).is_none() {
            return Err(FinsyncError::NotFound(format!("交易不存在: {}", id)));
        }

        if self.can_call_directly(&store, &target).await? {
            match self.remote.delete_entity(&target).await {
                Ok(()) => {
                    self.apply_direct(&store, generation, RealtimeEvent::Delete { id: target })
                        .await;
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!("直连删除失败，转入离线队列: id={}, error={}", target, e);
                }
                Err(e) => return Err(FinsyncError::remote("delete", &target, e)),
            }
        }

        {
            let _session = self
                .session_if_current(generation)
                .await
                .ok_or_else(session_switched)?;
            store.enqueue_delete(&target).await?;
            self.overlay.mark_deleted_optimistic(&target);
        }
        self.after_queued(&store, PendingKind::Delete, &target).await;
        Ok(())
    }

    /// 目标在日志里还有排队中的修改或删除时必须继续排队，保证回放顺序
    async fn can_call_directly(&self, store: &LocalStore, target: &str) -> Result<bool> {
        if !self.network.is_online() || is_local_id(target) {
            return Ok(false);
        }
        Ok(!store.has_pending_for(target).await?)
    }

    /// 直连成功后写入权威视图并落盘；会话已切换则丢弃，避免写进别的用户
    async fn apply_direct(&self, store: &LocalStore, generation: u64, confirmed: RealtimeEvent) {
        let Some(_session) = self.session_if_current(generation).await else {
            warn!("会话已切换，直连结果不写入当前会话: id={}", confirmed.entity_id());
            return;
        };
        self.overlay.apply_authoritative(&confirmed);
        self.persist_snapshot(store).await;
    }

    fn find_visible(&self, id: &str) -> Option<TransactionRecord> {
        self.overlay.merged_view().into_iter().find(|r| r.id == id)
    }

    async fn persist_snapshot(&self, store: &LocalStore) {
        if let Err(e) = store
            .replace_cache(self.overlay.authoritative_snapshot())
            .await
        {
            warn!("写入本地快照失败: {}", e);
        }
    }

    async fn after_queued(&self, store: &LocalStore, kind: PendingKind, entity_id: &str) {
        info!("📥 变更已入队: kind={}, id={}", kind, entity_id);
        self.event_manager
            .emit(event_builders::mutation_queued(kind, entity_id))
            .await;
        match store.pending_count().await {
            Ok(counts) => {
                self.event_manager
                    .emit(event_builders::pending_operations_changed(counts))
                    .await
            }
            Err(e) => warn!("读取待同步数量失败: {}", e),
        }
    }

    // ========== 读取与同步 ==========

    /// 并集视图：权威快照 + 未确认的本地变更
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.overlay.merged_view()
    }

    pub fn summary(&self) -> Summary {
        self.overlay.current_summary()
    }

    /// 从后端拉取列表并替换本地快照
    pub async fn refresh_cache(&self) -> Result<Vec<TransactionRecord>> {
        let store = self.active_store().await?;
        let records = self
            .remote
            .list_entities(&self.config.sync_config.list_filters)
            .await
            .map_err(|e| FinsyncError::remote("list", "*", e))?;
        store.replace_cache(records.clone()).await?;
        self.overlay.set_authoritative(records);
        Ok(self.overlay.merged_view())
    }

    /// 立即执行一轮同步；已有同步在跑时返回 `SyncInProgress`
    pub async fn manual_sync(&self) -> Result<SyncResult> {
        self.active_engine().await?.sync().await
    }

    /// 有待同步变更时才同步
    async fn sync_if_pending(&self) {
        let (store, engine) = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(s) => (s.store.clone(), s.engine.clone()),
                None => return,
            }
        };
        match store.has_pending().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("检查待同步变更失败: {}", e);
                return;
            }
        }
        match engine.sync().await {
            Ok(result) => debug!("自动同步完成: success={}", result.success),
            Err(FinsyncError::SyncInProgress) => debug!("自动同步跳过：已有同步在进行"),
            Err(e) => warn!("自动同步失败: {}", e),
        }
    }

    /// 上次同步时间（毫秒）
    pub async fn get_last_sync_time(&self) -> Result<Option<i64>> {
        self.active_engine().await?.last_sync_time()
    }

    pub async fn last_sync_result(&self) -> Option<SyncResult> {
        self.active_engine().await.ok()?.last_result()
    }

    pub async fn has_pending_operations(&self) -> Result<bool> {
        self.active_store().await?.has_pending().await
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        self.active_store().await?.pending_count().await
    }

    // ========== 推送通道 ==========

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.get_state()
    }

    /// 拆除并重建当前用户的推送订阅，重连计数归零
    pub async fn reconnect_realtime(&self) -> Result<()> {
        let mut guard = self.session.write().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| FinsyncError::NotInitialized("尚未调用 init_session".to_string()))?;
        let subscription = session
            .listener
            .reconnect(&session.user_id, session.handler.clone())
            .await?;
        session.subscription = Some(subscription);
        Ok(())
    }

    // ========== 网络 ==========

    pub fn network_status(&self) -> NetworkStatus {
        self.network.get_status()
    }

    /// 手动覆盖网络状态（平台层未接入时使用）
    pub fn set_network_status(&self, status: NetworkStatus) {
        self.network.set_status(status);
    }

    // ========== 订阅 ==========

    /// 订阅汇总：立即回调一次当前值，之后每次重算回调一次
    pub fn subscribe_to_summary<F>(&self, callback: F) -> TaskHandle
    where
        F: Fn(Summary) + Send + Sync + 'static,
    {
        let mut receiver = self.overlay.subscribe_summary();
        let handle = tokio::spawn(async move {
            let current = receiver.borrow_and_update().clone();
            callback(current);
            while receiver.changed().await.is_ok() {
                let summary = receiver.borrow_and_update().clone();
                callback(summary);
            }
        });
        TaskHandle::new("summary", handle)
    }

    /// 订阅推送通道连接状态
    pub fn subscribe_to_connection_state<F>(&self, callback: F) -> TaskHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut receiver = self.connection_state.subscribe();
        let handle = tokio::spawn(async move {
            let current = receiver.borrow_and_update().clone();
            callback(current);
            while receiver.changed().await.is_ok() {
                let state = receiver.borrow_and_update().clone();
                callback(state);
            }
        });
        TaskHandle::new("connection_state", handle)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.event_manager.subscribe()
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }
}

impl Drop for FinsyncSDK {
    fn drop(&mut self) {
        for task in self.background_tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn session_switched() -> FinsyncError {
    FinsyncError::NotInitialized("会话已切换".to_string())
}

/// 临时 ID 已有服务端映射时换成服务端 ID，否则原样返回
async fn resolve_key(store: &LocalStore, id: &str) -> Result<String> {
    if is_local_id(id) {
        Ok(store.resolve_id(id).await?.unwrap_or_else(|| id.to_string()))
    } else {
        Ok(id.to_string())
    }
}

/// 转发网络变化为事件；离线 → 在线且有待同步变更时自动同步
async fn run_network_watcher(sdk: Weak<FinsyncSDK>, mut receiver: broadcast::Receiver<NetworkStatusEvent>) {
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("网络事件积压，丢弃 {} 条", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(sdk) = sdk.upgrade() else {
            break;
        };

        sdk.event_manager
            .emit(event_builders::network_status_changed(
                event.old_status,
                event.new_status,
            ))
            .await;

        if event.came_online() && sdk.config.sync_config.auto_sync_on_reconnect {
            info!("🌐 网络恢复，检查待同步变更");
            sdk.sync_if_pending().await;
        }
    }
    debug!("网络监听任务退出");
}

async fn run_connection_state_forwarder(
    events: Arc<EventManager>,
    state: ConnectionStateManager,
) {
    let mut receiver = state.subscribe();
    while receiver.changed().await.is_ok() {
        let snapshot = receiver.borrow_and_update().clone();
        events
            .emit(event_builders::connection_state_changed(snapshot))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_helpers::ManualNetworkListener;
    use crate::realtime::{ChannelMessage, ConnectionStatus};
    use crate::storage::entities::TransactionKind;
    use crate::test_support::{FakePushProvider, FakeRemoteBackend};
    use std::time::Duration;

    struct Env {
        dir: tempfile::TempDir,
        sdk: Arc<FinsyncSDK>,
        remote: Arc<FakeRemoteBackend>,
        push: Arc<FakePushProvider>,
        network: Arc<ManualNetworkListener>,
    }

    async fn env(status: NetworkStatus) -> Env {
        env_with(status, true).await
    }

    async fn env_with(status: NetworkStatus, auto_sync: bool) -> Env {
        crate::test_support::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemoteBackend::new());
        let push = Arc::new(FakePushProvider::new());
        let network = Arc::new(ManualNetworkListener::new(status));
        let config = FinsyncConfig::builder()
            .data_dir(dir.path())
            .reconnect_config(ReconnectConfig {
                max_attempts: 3,
                initial_interval_ms: 5,
                max_interval_ms: 20,
                backoff_multiplier: 2.0,
                jitter_ratio: 0.0,
            })
            .auto_sync_on_reconnect(auto_sync)
            .build();
        let sdk = FinsyncSDK::initialize(
            config,
            Collaborators::new(push.clone())
                .with_remote(remote.clone())
                .with_network_listener(network.clone()),
        )
        .await
        .unwrap();
        Env {
            dir,
            sdk,
            remote,
            push,
            network,
        }
    }

    fn food(amount: f64) -> NewTransaction {
        NewTransaction::new(amount, TransactionKind::Expense, "food")
    }

    async fn wait_connected(sdk: &FinsyncSDK) {
        let mut state = sdk.connection_state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| s.status == ConnectionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn wait_until_synced(sdk: &FinsyncSDK) {
        tokio::time::timeout(Duration::from_secs(3), async {
            // 结果在整轮结束后才写入，日志清空时快照可能还没刷新
            while sdk.has_pending_operations().await.unwrap()
                || sdk.last_sync_result().await.is_none()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("待同步变更未在时限内清空");
    }

    #[tokio::test]
    async fn test_config_validation() {
        let config = FinsyncConfig::builder().data_dir("/tmp/finsync-test").build();
        let err = FinsyncSDK::initialize(config, Collaborators::new(Arc::new(FakePushProvider::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, FinsyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let env = env(NetworkStatus::Online).await;
        assert!(matches!(
            env.sdk.manual_sync().await,
            Err(FinsyncError::NotInitialized(_))
        ));
        assert!(env.sdk.create_transaction(food(1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_create_syncs_when_network_returns() {
        let env = env(NetworkStatus::Offline).await;
        env.sdk.init_session("alice").await.unwrap();

        let record = env.sdk.create_transaction(food(100.0)).await.unwrap();
        assert!(is_local_id(&record.id));
        assert_eq!(env.remote.call_count("create"), 0);
        assert!(env.sdk.has_pending_operations().await.unwrap());
        assert_eq!(env.sdk.summary().total_expenses, 100.0);

        env.network.set(NetworkStatus::Online);
        wait_until_synced(&env.sdk).await;

        assert_eq!(env.remote.records().len(), 1);
        let listed = env.sdk.transactions();
        assert_eq!(listed.len(), 1);
        assert!(!is_local_id(&listed[0].id));
        assert_eq!(env.sdk.summary().transaction_count, 1);
        assert!(env.sdk.get_last_sync_time().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_online_create_goes_direct() {
        let env = env(NetworkStatus::Online).await;
        env.sdk.init_session("alice").await.unwrap();

        let record = env.sdk.create_transaction(food(12.0)).await.unwrap();
        assert_eq!(record.id, "srv-1");
        assert!(!env.sdk.has_pending_operations().await.unwrap());
        assert_eq!(env.sdk.summary().total_expenses, 12.0);
    }

    #[tokio::test]
    async fn test_lost_direct_response_is_not_duplicated() {
        let env = env(NetworkStatus::Online).await;
        env.sdk.init_session("alice").await.unwrap();

        env.remote.lose_responses(true);
        let record = env.sdk.create_transaction(food(30.0)).await.unwrap();
        assert!(is_local_id(&record.id));
        assert!(env.sdk.has_pending_operations().await.unwrap());

        env.remote.lose_responses(false);
        let result = env.sdk.manual_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(env.remote.call_count("create"), 2);
        assert_eq!(env.remote.records().len(), 1);
        assert_eq!(env.sdk.summary().total_expenses, 30.0);
    }

    #[tokio::test]
    async fn test_offline_edits_of_local_record_replay_in_order() {
        let env = env(NetworkStatus::Offline).await;
        env.sdk.init_session("alice").await.unwrap();

        let record = env.sdk.create_transaction(food(10.0)).await.unwrap();
        let patched = env
            .sdk
            .update_transaction(&record.id, TransactionPatch::new().amount(25.0))
            .await
            .unwrap();
        assert_eq!(patched.amount, 25.0);
        assert_eq!(env.sdk.summary().total_expenses, 25.0);

        env.network.set(NetworkStatus::Online);
        wait_until_synced(&env.sdk).await;
        assert_eq!(env.remote.records()[0].amount, 25.0);
        assert_eq!(env.sdk.summary().transaction_count, 1);
        assert_eq!(env.sdk.summary().total_expenses, 25.0);
    }

    #[tokio::test]
    async fn test_push_update_retires_optimistic_entry() {
        let env = env(NetworkStatus::Offline).await;
        env.remote.seed(food(5.0).to_record("srv-a", None));
        env.sdk.init_session("alice").await.unwrap();
        env.sdk.refresh_cache().await.unwrap();

        env.sdk
            .update_transaction("srv-a", TransactionPatch::new().amount(9.0))
            .await
            .unwrap();
        assert_eq!(env.sdk.summary().total_expenses, 9.0);

        wait_connected(&env.sdk).await;

        let confirmed = TransactionPatch::new()
            .amount(9.0)
            .apply_to(&food(5.0).to_record("srv-a", None));
        env.push
            .push(
                "alice",
                ChannelMessage::Event(RealtimeEvent::Update(confirmed)),
            )
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while env.sdk.overlay.is_optimistic("srv-a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(env.sdk.summary().total_expenses, 9.0);
        assert_eq!(env.sdk.summary().transaction_count, 1);
    }

    #[tokio::test]
    async fn test_direct_create_finishing_after_switch_stays_out_of_new_session() {
        let env = env(NetworkStatus::Online).await;
        env.sdk.init_session("alice").await.unwrap();
        env.remote.set_delay(Duration::from_millis(200));

        let sdk = env.sdk.clone();
        let pending = tokio::spawn(async move { sdk.create_transaction(food(50.0)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        env.sdk.init_session("bob").await.unwrap();
        let created = pending.await.unwrap().unwrap();
        assert_eq!(created.id, "srv-1");

        assert!(env.sdk.transactions().is_empty());
        assert_eq!(env.sdk.summary().transaction_count, 0);

        // bob 的下一条推送会把权威视图落盘，里面不能有 alice 的记录
        wait_connected(&env.sdk).await;
        let mut events = env.sdk.subscribe_events();
        env.push
            .push(
                "bob",
                ChannelMessage::Event(RealtimeEvent::Insert(food(1.0).to_record("srv-bob", None))),
            )
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while !matches!(
                events.recv().await.unwrap(),
                SDKEvent::RealtimeEventApplied { .. }
            ) {}
        })
        .await
        .unwrap();

        let ids: Vec<_> = env.sdk.transactions().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["srv-bob"]);
        assert_eq!(env.sdk.summary().total_expenses, 1.0);
        let cached: Vec<_> = env
            .sdk
            .active_store()
            .await
            .unwrap()
            .read_cache()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(cached, vec!["srv-bob"]);
    }

    #[tokio::test]
    async fn test_edit_after_push_still_queues_behind_pending_update() {
        let env = env_with(NetworkStatus::Offline, false).await;
        env.remote.seed(food(5.0).to_record("srv-a", None));
        env.sdk.init_session("alice").await.unwrap();
        env.sdk.refresh_cache().await.unwrap();

        env.sdk
            .update_transaction("srv-a", TransactionPatch::new().amount(9.0))
            .await
            .unwrap();

        // 别的设备的修改推送过来，覆盖层条目退役，但日志里的修改还没发出
        wait_connected(&env.sdk).await;
        let other_device = TransactionPatch::new()
            .amount(7.0)
            .apply_to(&food(5.0).to_record("srv-a", None));
        env.push
            .push("alice", ChannelMessage::Event(RealtimeEvent::Update(other_device)))
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while env.sdk.overlay.is_optimistic("srv-a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        env.sdk.set_network_status(NetworkStatus::Online);
        env.sdk
            .update_transaction("srv-a", TransactionPatch::new().amount(20.0))
            .await
            .unwrap();
        assert_eq!(env.remote.call_count("update"), 0);
        assert_eq!(env.sdk.pending_counts().await.unwrap().update, 2);

        let result = env.sdk.manual_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_counts.update, 2);
        assert_eq!(env.remote.records()[0].amount, 20.0);
        assert_eq!(env.sdk.summary().total_expenses, 20.0);

        // 日志清空后恢复直连
        env.sdk
            .update_transaction("srv-a", TransactionPatch::new().amount(21.0))
            .await
            .unwrap();
        assert_eq!(env.remote.call_count("update"), 3);
        assert!(!env.sdk.has_pending_operations().await.unwrap());
    }

    #[tokio::test]
    async fn test_session_switch_isolates_users() {
        let env = env(NetworkStatus::Offline).await;
        env.sdk.init_session("alice").await.unwrap();
        env.sdk.create_transaction(food(7.0)).await.unwrap();

        env.sdk.init_session("bob").await.unwrap();
        assert_eq!(env.sdk.current_user_id().await.as_deref(), Some("bob"));
        assert!(!env.sdk.has_pending_operations().await.unwrap());
        assert!(env.sdk.transactions().is_empty());

        // 重新打开后从未同步日志恢复覆盖层
        env.sdk.init_session("alice").await.unwrap();
        assert!(env.sdk.has_pending_operations().await.unwrap());
        assert_eq!(env.sdk.transactions().len(), 1);
        assert_eq!(env.sdk.summary().total_expenses, 7.0);
        assert!(env.dir.path().join("users").exists());
    }

    #[tokio::test]
    async fn test_callbacks_receive_summary_and_connection_state() {
        let env = env(NetworkStatus::Online).await;
        let summaries = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let s = summaries.clone();
        let _summary_handle = env.sdk.subscribe_to_summary(move |summary| s.lock().push(summary));
        let c = states.clone();
        let _state_handle =
            env.sdk
                .subscribe_to_connection_state(move |state| c.lock().push(state.status));

        env.sdk.init_session("alice").await.unwrap();
        env.sdk.create_transaction(food(4.0)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let got_summary = summaries
                    .lock()
                    .last()
                    .map_or(false, |s| s.total_expenses == 4.0);
                let got_state = states.lock().contains(&ConnectionStatus::Connected);
                if got_summary && got_state {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_teardown_closes_channel() {
        let env = env(NetworkStatus::Online).await;
        env.sdk.init_session("alice").await.unwrap();
        wait_connected(&env.sdk).await;

        env.sdk.teardown().await;
        assert_eq!(env.push.live_channels("alice"), 0);
        assert!(!env.sdk.connection_state().is_connected);
        assert!(env.sdk.current_user_id().await.is_none());
        assert!(env.sdk.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_network_changes_are_published() {
        let env = env(NetworkStatus::Offline).await;
        let mut events = env.sdk.subscribe_events();
        env.network.set(NetworkStatus::Online);

        let new_status = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let SDKEvent::NetworkStatusChanged { new_status, .. } =
                    events.recv().await.unwrap()
                {
                    break new_status;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(new_status, NetworkStatus::Online);
    }
}
