//! 乐观覆盖层
//!
//! 权威视图（最近一次缓存 / 推送结果）之上叠加尚未被后端确认的本地变更。
//! 汇总总是基于两者的并集重算：同 ID 以覆盖层为准，墓碑隐藏对应 ID。
//!
//! 所有写操作都是按 ID 整条替换，读者拿到的永远是快照副本。
//! 修改、重算与发布在同一把写锁内完成，发布顺序与修改顺序一致。

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::realtime::RealtimeEvent;
use crate::storage::entities::{
    PendingCreate, PendingDelete, PendingUpdate, TransactionPatch, TransactionRecord,
};
use crate::summary::{Summary, SummaryCalculator};

/// 覆盖层条目
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEntry {
    /// 乐观新建 / 修改后的实体
    Upsert(TransactionRecord),
    /// 乐观删除（墓碑）
    Deleted,
}

#[derive(Debug, Default)]
struct OverlayState {
    /// 权威视图，保留后端返回顺序
    authoritative: Vec<TransactionRecord>,
    entries: HashMap<String, OverlayEntry>,
    /// 覆盖层插入顺序，决定仅存在于覆盖层的实体的展示顺序
    order: Vec<String>,
}

impl OverlayState {
    fn upsert(&mut self, id: String, entry: OverlayEntry) {
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.entries.remove(id).is_some() {
            self.order.retain(|k| k != id);
            true
        } else {
            false
        }
    }

    fn apply_authoritative(&mut self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::Insert(record) | RealtimeEvent::Update(record) => {
                match self.authoritative.iter_mut().find(|r| r.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => self.authoritative.insert(0, record.clone()),
                }
            }
            RealtimeEvent::Delete { id } => self.authoritative.retain(|r| &r.id != id),
        }
    }

    /// 并集视图：仅在覆盖层中的实体（新的在前）+ 权威视图（被覆盖的替换，被墓碑的去掉）
    fn merged(&self) -> Vec<TransactionRecord> {
        let authoritative_ids: HashSet<&str> =
            self.authoritative.iter().map(|r| r.id.as_str()).collect();

        let mut out = Vec::with_capacity(self.authoritative.len() + self.order.len());
        for id in self.order.iter().rev() {
            if authoritative_ids.contains(id.as_str()) {
                continue;
            }
            if let Some(OverlayEntry::Upsert(record)) = self.entries.get(id) {
                out.push(record.clone());
            }
        }
        for record in &self.authoritative {
            match self.entries.get(&record.id) {
                Some(OverlayEntry::Upsert(overridden)) => out.push(overridden.clone()),
                Some(OverlayEntry::Deleted) => {}
                None => out.push(record.clone()),
            }
        }
        out
    }

    fn current(&self, id: &str) -> Option<TransactionRecord> {
        match self.entries.get(id) {
            Some(OverlayEntry::Upsert(record)) => Some(record.clone()),
            Some(OverlayEntry::Deleted) => None,
            None => self.authoritative.iter().find(|r| r.id == id).cloned(),
        }
    }
}

/// 乐观覆盖层
#[derive(Debug, Clone)]
pub struct OptimisticOverlay {
    state: Arc<RwLock<OverlayState>>,
    calculator: Arc<dyn SummaryCalculator>,
    summary: Arc<watch::Sender<Summary>>,
}

impl OptimisticOverlay {
    pub fn new(calculator: Arc<dyn SummaryCalculator>) -> Self {
        let (summary, _) = watch::channel(Summary::default());
        Self {
            state: Arc::new(RwLock::new(OverlayState::default())),
            calculator,
            summary: Arc::new(summary),
        }
    }

    /// 持有写锁完成修改并发布新汇总
    fn mutate<R>(&self, f: impl FnOnce(&mut OverlayState) -> R) -> R {
        let mut state = self.state.write();
        let out = f(&mut *state);
        self.publish(&state);
        out
    }

    fn publish(&self, state: &OverlayState) -> Summary {
        let summary = self.calculator.compute(&state.merged());
        self.summary.send_replace(summary.clone());
        summary
    }

    /// 插入一条乐观实体并重算
    pub fn add_optimistic(&self, entity: TransactionRecord) {
        debug!("乐观新增: id={}", entity.id);
        self.mutate(|state| state.upsert(entity.id.clone(), OverlayEntry::Upsert(entity)));
    }

    /// 按 ID 整条替换并重算
    pub fn update_optimistic(&self, entity: TransactionRecord) {
        debug!("乐观修改: id={}", entity.id);
        self.mutate(|state| state.upsert(entity.id.clone(), OverlayEntry::Upsert(entity)));
    }

    /// 把补丁应用到当前可见版本上；实体不可见时返回 None
    pub fn apply_patch_optimistic(
        &self,
        id: &str,
        patch: &TransactionPatch,
    ) -> Option<TransactionRecord> {
        let mut state = self.state.write();
        let patched = patch.apply_to(&state.current(id)?);
        state.upsert(id.to_string(), OverlayEntry::Upsert(patched.clone()));
        self.publish(&state);
        Some(patched)
    }

    /// 乐观删除：本地新建的实体直接移除，其它实体打墓碑
    pub fn mark_deleted_optimistic(&self, id: &str) {
        debug!("乐观删除: id={}", id);
        self.mutate(|state| {
            let in_authoritative = state.authoritative.iter().any(|r| r.id == id);
            if in_authoritative {
                state.upsert(id.to_string(), OverlayEntry::Deleted);
            } else {
                state.remove(id);
            }
        });
    }

    /// 移除条目；不存在是 no-op，返回是否真的移除了
    pub fn remove_optimistic(&self, id: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.remove(id);
        if removed {
            debug!("乐观条目已移除: id={}", id);
            self.publish(&state);
        }
        removed
    }

    /// 移除条目但不发布，由调用方在后续步骤统一重算
    pub(crate) fn retire(&self, id: &str) -> bool {
        let removed = self.state.write().remove(id);
        if removed {
            debug!("乐观条目已退役: id={}", id);
        }
        removed
    }

    /// 远端确认：退役 `overlay_id` 并把确认结果写入权威视图，一次重算
    pub fn confirm(&self, overlay_id: &str, confirmed: &RealtimeEvent) {
        self.mutate(|state| {
            state.remove(overlay_id);
            state.apply_authoritative(confirmed);
        });
    }

    /// 新建已确认，但仍有未同步的修改指向它：条目从临时 ID 改挂到服务端 ID
    pub fn rekey_confirmed(&self, local_id: &str, confirmed: TransactionRecord) {
        self.mutate(|state| {
            let pending = state.entries.get(local_id).cloned();
            state.remove(local_id);
            let server_id = confirmed.id.clone();
            state.apply_authoritative(&RealtimeEvent::Insert(confirmed));
            if let Some(entry) = pending {
                let entry = match entry {
                    OverlayEntry::Upsert(mut record) => {
                        record.id = server_id.clone();
                        OverlayEntry::Upsert(record)
                    }
                    OverlayEntry::Deleted => OverlayEntry::Deleted,
                };
                debug!("乐观条目改挂: {} -> {}", local_id, server_id);
                state.upsert(server_id, entry);
            }
        });
    }

    pub fn is_optimistic(&self, id: &str) -> bool {
        self.state.read().entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<OverlayEntry> {
        self.state.read().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空覆盖层（登出）
    pub fn clear(&self) {
        self.mutate(|state| {
            state.entries.clear();
            state.order.clear();
        });
    }

    /// 清空覆盖层与权威视图，汇总回到空值
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = OverlayState::default();
        self.summary.send_replace(Summary::default());
    }

    /// 整体替换权威视图
    pub fn set_authoritative(&self, records: Vec<TransactionRecord>) {
        self.mutate(|state| state.authoritative = records);
    }

    /// 把一条推送事件应用到权威视图（按 ID upsert / 删除）
    pub fn apply_authoritative(&self, event: &RealtimeEvent) {
        self.mutate(|state| state.apply_authoritative(event));
    }

    pub fn authoritative_snapshot(&self) -> Vec<TransactionRecord> {
        self.state.read().authoritative.clone()
    }

    /// 供 UI 列表使用的并集视图
    pub fn merged_view(&self) -> Vec<TransactionRecord> {
        self.state.read().merged()
    }

    /// 基于并集重算汇总并发布
    pub fn recompute(&self) -> Summary {
        let state = self.state.read();
        self.publish(&state)
    }

    pub fn current_summary(&self) -> Summary {
        self.summary.borrow().clone()
    }

    pub fn subscribe_summary(&self) -> watch::Receiver<Summary> {
        self.summary.subscribe()
    }

    /// 重启后根据未同步日志重建覆盖层
    ///
    /// update / delete 的目标 ID 应已由调用方通过 ID 映射解析过。
    pub fn rebuild_from_pending(
        &self,
        creates: &[PendingCreate],
        updates: &[PendingUpdate],
        deletes: &[PendingDelete],
    ) {
        self.mutate(|state| {
            state.entries.clear();
            state.order.clear();

            for create in creates {
                let record = create.payload.to_record(&create.local_id, None);
                state.upsert(create.local_id.clone(), OverlayEntry::Upsert(record));
            }
            for update in updates {
                if let Some(base) = state.current(&update.target_entity_id) {
                    let patched = update.patch.apply_to(&base);
                    state.upsert(update.target_entity_id.clone(), OverlayEntry::Upsert(patched));
                }
            }
            for delete in deletes {
                let id = &delete.target_entity_id;
                if state.authoritative.iter().any(|r| &r.id == id) {
                    state.upsert(id.clone(), OverlayEntry::Deleted);
                } else {
                    state.remove(id);
                }
            }
            debug!("覆盖层已从未同步日志重建: {} 条", state.entries.len());
        });
    }
}
