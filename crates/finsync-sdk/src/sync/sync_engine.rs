/// 同步引擎
///
/// 一轮 `sync()` 依次执行：
/// 0. 抵消：删除指向仍未同步的新建时，新建、其后的修改与删除一并在本地标记完成
/// 1. 新建，按入队顺序，临时 ID 作为幂等键
/// 2. 修改，目标经 ID 映射解析；仍是无映射的临时 ID 则延后
/// 3. 删除，同上
/// 4. 清理已同步日志
/// 5. 拉取列表，替换本地快照与覆盖层的权威视图
/// 6. 记录 `last_sync_time`
///
/// 单条远端失败只记入结果，条目保留到下一轮；本地存储失败中止整轮。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{FinsyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::overlay::OptimisticOverlay;
use crate::realtime::RealtimeEvent;
use crate::remote::{ListFilters, RemoteBackend};
use crate::storage::entities::{is_local_id, PendingKind, PendingMutation};
use crate::storage::{meta_keys, LocalStore};
use crate::sync::{SyncResult, SyncedCounts};
use crate::utils::now_millis;

/// 一轮同步中的累计状态
#[derive(Debug, Default)]
struct SyncRun {
    counts: SyncedCounts,
    errors: Vec<String>,
    deferred: usize,
    coalesced: usize,
    /// 每个目标（原始 ID）剩余未回放的修改 / 删除数
    remaining: HashMap<String, usize>,
    /// 本轮已失败的目标，后续指向它的变更不再发送以保持顺序
    blocked: HashSet<String>,
}

impl SyncRun {
    fn fail(&mut self, operation: &str, id: &str, cause: FinsyncError) {
        let err = FinsyncError::remote(operation, id, cause);
        warn!("{}", err);
        self.errors.push(err.to_string());
    }

    /// 目标的一条变更已回放，返回是否已无剩余
    fn settle(&mut self, target: &str) -> bool {
        match self.remaining.get_mut(target) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            _ => {
                self.remaining.remove(target);
                true
            }
        }
    }
}

/// 同步引擎
pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteBackend>,
    overlay: OptimisticOverlay,
    events: Option<Arc<EventManager>>,
    filters: ListFilters,

    /// 同一时刻只允许一轮同步；并发调用立即失败而不是排队
    guard: Mutex<()>,

    last_result: parking_lot::RwLock<Option<SyncResult>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("user_id", &self.store.user_id())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteBackend>,
        overlay: OptimisticOverlay,
    ) -> Self {
        Self {
            store,
            remote,
            overlay,
            events: None,
            filters: ListFilters::default(),
            guard: Mutex::new(()),
            last_result: parking_lot::RwLock::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    /// 刷新快照时使用的列表条件
    pub fn with_filters(mut self, filters: ListFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    pub fn last_result(&self) -> Option<SyncResult> {
        self.last_result.read().clone()
    }

    /// 上次成功走完一轮的时间（毫秒）
    pub fn last_sync_time(&self) -> Result<Option<i64>> {
        self.store.get_meta(meta_keys::LAST_SYNC_TIME)
    }

    /// 执行一轮同步
    ///
    /// 已有同步在跑时返回 `Err(SyncInProgress)`。
    pub async fn sync(&self) -> Result<SyncResult> {
        let _guard = self.guard.try_lock().map_err(|_| {
            debug!("已有同步在进行，本次调用直接返回");
            FinsyncError::SyncInProgress
        })?;

        let started_at = now_millis();
        info!("🔄 开始同步: user={}", self.store.user_id());
        self.emit(event_builders::sync_started()).await;

        let mut run = SyncRun::default();
        let result = match self.run_phases(&mut run).await {
            Ok(()) => SyncResult {
                success: run.errors.is_empty(),
                synced_counts: run.counts,
                errors: run.errors,
                deferred: run.deferred,
                coalesced: run.coalesced,
                started_at,
                finished_at: now_millis(),
            },
            Err(e) => {
                error!("❌ 同步中止，本地存储失败: {}", e);
                SyncResult {
                    success: false,
                    synced_counts: run.counts,
                    errors: vec![e.to_string()],
                    deferred: run.deferred,
                    coalesced: run.coalesced,
                    started_at,
                    finished_at: now_millis(),
                }
            }
        };

        info!(
            "✅ 同步结束: success={}, create={}, update={}, delete={}, deferred={}, errors={}, 耗时 {}ms",
            result.success,
            result.synced_counts.create,
            result.synced_counts.update,
            result.synced_counts.delete,
            result.deferred,
            result.errors.len(),
            result.duration_ms()
        );

        *self.last_result.write() = Some(result.clone());
        if let Ok(counts) = self.store.pending_count().await {
            self.emit(event_builders::pending_operations_changed(counts))
                .await;
        }
        self.emit(event_builders::sync_completed(result.clone()))
            .await;
        Ok(result)
    }

    async fn run_phases(&self, run: &mut SyncRun) -> Result<()> {
        self.coalesce(run).await?;

        let updates = self.store.list_pending(PendingKind::Update).await?;
        let deletes = self.store.list_pending(PendingKind::Delete).await?;
        for mutation in updates.iter().chain(deletes.iter()) {
            *run.remaining
                .entry(mutation.target_id().to_string())
                .or_insert(0) += 1;
        }

        self.replay_creates(run).await?;
        self.replay_targeted(run, updates).await?;
        self.replay_targeted(run, deletes).await?;

        self.store.purge_synced().await?;

        self.refresh_snapshot(run).await?;

        self.store.set_meta(meta_keys::LAST_SYNC_TIME, &now_millis())?;
        Ok(())
    }

    async fn coalesce(&self, run: &mut SyncRun) -> Result<()> {
        let creates: HashSet<String> = self
            .store
            .list_pending(PendingKind::Create)
            .await?
            .into_iter()
            .map(|m| m.id().to_string())
            .collect();
        if creates.is_empty() {
            return Ok(());
        }

        let mut cancelled = HashSet::new();
        for delete in self.store.list_pending(PendingKind::Delete).await? {
            if creates.contains(delete.target_id()) {
                self.store
                    .mark_synced(PendingKind::Delete, delete.id())
                    .await?;
                cancelled.insert(delete.target_id().to_string());
            }
        }
        if cancelled.is_empty() {
            return Ok(());
        }

        for update in self.store.list_pending(PendingKind::Update).await? {
            if cancelled.contains(update.target_id()) {
                self.store
                    .mark_synced(PendingKind::Update, update.id())
                    .await?;
            }
        }
        for local_id in &cancelled {
            self.store.mark_synced(PendingKind::Create, local_id).await?;
            self.overlay.remove_optimistic(local_id);
            debug!("新建与删除在本地抵消: local_id={}", local_id);
        }
        run.coalesced += cancelled.len();
        Ok(())
    }

    async fn replay_creates(&self, run: &mut SyncRun) -> Result<()> {
        for mutation in self.store.list_pending(PendingKind::Create).await? {
            let PendingMutation::Create(create) = mutation else {
                continue;
            };

            match self
                .remote
                .create_entity(&create.payload, &create.local_id)
                .await
            {
                Ok(record) => {
                    self.store
                        .record_id_mapping(&create.local_id, &record.id)
                        .await?;
                    self.store
                        .mark_synced(PendingKind::Create, &create.local_id)
                        .await?;
                    debug!("新建已同步: {} -> {}", create.local_id, record.id);

                    if run.remaining.contains_key(&create.local_id) {
                        self.overlay.rekey_confirmed(&create.local_id, record);
                    } else {
                        self.overlay
                            .confirm(&create.local_id, &RealtimeEvent::Insert(record));
                    }
                    run.counts.create += 1;
                }
                Err(e) => {
                    run.fail("create", &create.local_id, e);
                    run.blocked.insert(create.local_id.clone());
                }
            }
        }
        Ok(())
    }

    /// 回放修改或删除日志
    async fn replay_targeted(&self, run: &mut SyncRun, mutations: Vec<PendingMutation>) -> Result<()> {
        for mutation in mutations {
            let raw_target = mutation.target_id().to_string();
            if run.blocked.contains(&raw_target) {
                debug!("目标本轮已失败，延后: kind={}, target={}", mutation.kind(), raw_target);
                run.deferred += 1;
                continue;
            }

            let Some(target) = self.resolve_target(&raw_target).await? else {
                debug!("目标仍是未同步的新建，延后: kind={}, target={}", mutation.kind(), raw_target);
                run.deferred += 1;
                continue;
            };

            let outcome = match &mutation {
                PendingMutation::Update(update) => self
                    .remote
                    .update_entity(&target, &update.patch)
                    .await
                    .map(RealtimeEvent::Update),
                PendingMutation::Delete(_) => self
                    .remote
                    .delete_entity(&target)
                    .await
                    .map(|()| RealtimeEvent::Delete { id: target.clone() }),
                PendingMutation::Create(_) => continue,
            };

            match outcome {
                Ok(confirmed) => {
                    self.store.mark_synced(mutation.kind(), mutation.id()).await?;
                    if run.settle(&raw_target) {
                        self.overlay.confirm(&target, &confirmed);
                    } else {
                        self.overlay.apply_authoritative(&confirmed);
                    }
                    match mutation.kind() {
                        PendingKind::Update => run.counts.update += 1,
                        PendingKind::Delete => run.counts.delete += 1,
                        PendingKind::Create => {}
                    }
                }
                Err(e) => {
                    run.fail(mutation.kind().as_str(), &target, e);
                    run.blocked.insert(raw_target);
                }
            }
        }
        Ok(())
    }

    /// 解析变更目标；`None` 表示目标是尚无服务端 ID 的临时 ID
    async fn resolve_target(&self, target: &str) -> Result<Option<String>> {
        if is_local_id(target) {
            self.store.resolve_id(target).await
        } else {
            Ok(Some(target.to_string()))
        }
    }

    async fn refresh_snapshot(&self, run: &mut SyncRun) -> Result<()> {
        match self.remote.list_entities(&self.filters).await {
            Ok(records) => {
                debug!("拉取到 {} 条记录，替换本地快照", records.len());
                self.store.replace_cache(records.clone()).await?;
                self.overlay.set_authoritative(records);
            }
            Err(e) => run.fail("list", "*", e),
        }
        Ok(())
    }

    async fn emit(&self, event: crate::events::SDKEvent) {
        if let Some(events) = &self.events {
            events.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayEntry;
    use crate::storage::entities::{NewTransaction, TransactionKind, TransactionPatch};
    use crate::summary::FinancialSummaryCalculator;
    use crate::test_support::FakeRemoteBackend;
    use std::time::Duration;

    struct Harness {
        dir: tempfile::TempDir,
        store: LocalStore,
        remote: Arc<FakeRemoteBackend>,
        overlay: OptimisticOverlay,
        engine: Arc<SyncEngine>,
    }

    async fn harness() -> Harness {
        crate::test_support::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), "alice").await.unwrap();
        let remote = Arc::new(FakeRemoteBackend::new());
        let overlay = OptimisticOverlay::new(Arc::new(FinancialSummaryCalculator));
        let engine = Arc::new(SyncEngine::new(store.clone(), remote.clone(), overlay.clone()));
        Harness {
            dir,
            store,
            remote,
            overlay,
            engine,
        }
    }

    fn food(amount: f64) -> NewTransaction {
        NewTransaction::new(amount, TransactionKind::Expense, "food")
    }

    #[tokio::test]
    async fn test_offline_create_then_sync() {
        let h = harness().await;
        let local_id = h.store.enqueue_create(food(100.0)).await.unwrap();
        h.overlay.add_optimistic(food(100.0).to_record(&local_id, None));
        assert!(h.store.has_pending().await.unwrap());

        let result = h.engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(
            result.synced_counts,
            SyncedCounts {
                create: 1,
                update: 0,
                delete: 0
            }
        );
        assert!(result.errors.is_empty());
        assert!(!h.store.has_pending().await.unwrap());

        // 覆盖层条目已退役，汇总不重复计数
        assert!(h.overlay.is_empty());
        let summary = h.overlay.current_summary();
        assert_eq!(summary.transaction_count, 1);
        assert_eq!(summary.total_expenses, 100.0);
        assert_eq!(h.store.read_cache().await.unwrap().len(), 1);
        assert!(h.engine.last_sync_time().unwrap().is_some());
        assert_eq!(h.engine.last_result(), Some(result));
    }

    #[tokio::test]
    async fn test_failed_delete_stays_pending_until_network_recovers() {
        let h = harness().await;
        h.store.enqueue_delete("abc").await.unwrap();
        h.remote.fail_on("delete", "abc");

        let result = h.engine.sync().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("RemoteOperationFailed: abc"));
        assert_eq!(h.store.pending_count().await.unwrap().delete, 1);

        h.remote.clear_failures();
        let result = h.engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_counts.delete, 1);
        assert!(!h.store.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_creates_replay_in_insertion_order() {
        let h = harness().await;
        let mut ids = Vec::new();
        for amount in [1.0, 2.0, 3.0] {
            ids.push(h.store.enqueue_create(food(amount)).await.unwrap());
        }

        h.engine.sync().await.unwrap();
        let sent: Vec<_> = h
            .remote
            .calls()
            .into_iter()
            .filter(|c| c.operation == "create")
            .map(|c| c.id)
            .collect();
        assert_eq!(sent, ids);
    }

    #[tokio::test]
    async fn test_all_creates_replay_before_any_update() {
        let h = harness().await;
        h.remote.seed(food(1.0).to_record("srv-x", None));
        h.remote.seed(food(2.0).to_record("srv-y", None));

        let c1 = h.store.enqueue_create(food(10.0)).await.unwrap();
        h.store
            .enqueue_update("srv-x", TransactionPatch::new().amount(11.0))
            .await
            .unwrap();
        let c2 = h.store.enqueue_create(food(20.0)).await.unwrap();
        h.store
            .enqueue_update("srv-y", TransactionPatch::new().amount(22.0))
            .await
            .unwrap();

        let result = h.engine.sync().await.unwrap();
        assert!(result.success);

        let calls = h.remote.calls();
        let operations: Vec<_> = calls.iter().map(|c| c.operation).collect();
        assert_eq!(operations, vec!["create", "create", "update", "update", "list"]);
        let ids: Vec<_> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids[..4], [c1.as_str(), c2.as_str(), "srv-x", "srv-y"]);
    }

    #[tokio::test]
    async fn test_lost_response_replay_is_deduplicated() {
        let h = harness().await;
        h.store.enqueue_create(food(10.0)).await.unwrap();

        h.remote.lose_responses(true);
        let result = h.engine.sync().await.unwrap();
        assert!(!result.success);
        assert_eq!(h.store.pending_count().await.unwrap().create, 1);

        h.remote.lose_responses(false);
        let result = h.engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(h.remote.call_count("create"), 2);
        assert_eq!(h.remote.records().len(), 1);
    }

    #[tokio::test]
    async fn test_synced_entries_not_replayed_after_restart() {
        let h = harness().await;
        h.store.enqueue_create(food(10.0)).await.unwrap();
        assert!(h.engine.sync().await.unwrap().success);
        h.store.close().await.unwrap();
        drop(h.engine);
        drop(h.store);

        let store = LocalStore::open(h.dir.path(), "alice").await.unwrap();
        let engine = SyncEngine::new(store, h.remote.clone(), h.overlay.clone());
        let result = engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_counts.total(), 0);
        assert_eq!(h.remote.call_count("create"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sync_fails_fast() {
        let h = harness().await;
        h.store.enqueue_create(food(10.0)).await.unwrap();
        h.remote.set_delay(Duration::from_millis(100));

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.sync().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.engine.is_syncing());

        let second = h.engine.sync().await;
        assert!(matches!(second, Err(FinsyncError::SyncInProgress)));

        let first = first.await.unwrap().unwrap();
        assert!(first.success);
        assert!(!h.engine.is_syncing());
        assert_eq!(h.remote.records().len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_unsynced_create_is_deferred() {
        let h = harness().await;
        let local_id = h.store.enqueue_create(food(10.0)).await.unwrap();
        h.store
            .enqueue_update(&local_id, TransactionPatch::new().amount(15.0))
            .await
            .unwrap();
        h.overlay.add_optimistic(food(10.0).to_record(&local_id, None));
        h.overlay
            .apply_patch_optimistic(&local_id, &TransactionPatch::new().amount(15.0));
        h.remote.fail_on("create", &local_id);

        let result = h.engine.sync().await.unwrap();
        assert_eq!(result.deferred, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(h.remote.call_count("update"), 0);
        assert_eq!(h.overlay.current_summary().total_expenses, 15.0);

        h.remote.clear_failures();
        let result = h.engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_counts.create, 1);
        assert_eq!(result.synced_counts.update, 1);

        let server_id = h.remote.records()[0].id.clone();
        let calls = h.remote.calls();
        assert!(calls.iter().any(|c| c.operation == "update" && c.id == server_id));
        assert_eq!(h.remote.records()[0].amount, 15.0);
        assert!(h.overlay.is_empty());
        assert_eq!(h.overlay.current_summary().total_expenses, 15.0);
    }

    #[tokio::test]
    async fn test_delete_of_unsynced_create_is_coalesced() {
        let h = harness().await;
        let local_id = h.store.enqueue_create(food(10.0)).await.unwrap();
        h.store
            .enqueue_update(&local_id, TransactionPatch::new().amount(11.0))
            .await
            .unwrap();
        h.store.enqueue_delete(&local_id).await.unwrap();

        let result = h.engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.coalesced, 1);
        assert_eq!(result.synced_counts.total(), 0);
        assert_eq!(h.remote.call_count("create"), 0);
        assert_eq!(h.remote.call_count("update"), 0);
        assert_eq!(h.remote.call_count("delete"), 0);
        assert!(!h.store.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_later_mutation_held_back_after_failure() {
        let h = harness().await;
        h.remote.seed(food(5.0).to_record("srv-a", None));
        h.store
            .enqueue_update("srv-a", TransactionPatch::new().amount(6.0))
            .await
            .unwrap();
        h.store.enqueue_delete("srv-a").await.unwrap();
        h.overlay.set_authoritative(h.remote.records());
        h.overlay.mark_deleted_optimistic("srv-a");
        h.remote.fail_on("update", "srv-a");

        let result = h.engine.sync().await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.deferred, 1);
        assert_eq!(h.remote.call_count("delete"), 0);
        // 乐观删除仍然可见
        assert_eq!(h.overlay.get("srv-a"), Some(OverlayEntry::Deleted));
        assert_eq!(h.overlay.current_summary().transaction_count, 0);

        h.remote.clear_failures();
        let result = h.engine.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_counts.update, 1);
        assert_eq!(result.synced_counts.delete, 1);
        assert!(h.remote.records().is_empty());
        assert!(h.overlay.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let h = harness().await;
        h.remote.fail_on("list", "");
        let result = h.engine.sync().await.unwrap();
        assert!(!result.success);
        assert!(result.errors[0].starts_with("RemoteOperationFailed: * (list)"));
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_run() {
        let h = harness().await;
        h.store.enqueue_create(food(1.0)).await.unwrap();
        h.store.close().await.unwrap();

        let result = h.engine.sync().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("StorageUnavailable"));
        assert_eq!(h.remote.call_count("create"), 0);
    }
}
