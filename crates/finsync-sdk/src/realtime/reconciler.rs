//! 推送事件对账
//!
//! 对每条权威事件按固定顺序处理：
//! 1. 退役同 ID 的覆盖层条目
//! 2. 调用订阅方回调
//! 3. 写入权威视图、落盘快照、重算汇总
//!
//! 重复事件无副作用：权威视图按 ID upsert，汇总每次重新计算。

use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::{event_builders, EventManager};
use crate::overlay::OptimisticOverlay;
use crate::realtime::{RealtimeEvent, RealtimeHandler};
use crate::storage::LocalStore;

#[derive(Debug, Clone)]
pub struct Reconciler {
    store: LocalStore,
    overlay: OptimisticOverlay,
    events: Option<Arc<EventManager>>,
}

impl Reconciler {
    pub fn new(store: LocalStore, overlay: OptimisticOverlay) -> Self {
        Self {
            store,
            overlay,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn apply(&self, event: &RealtimeEvent, handler: &dyn RealtimeHandler) {
        let id = event.entity_id();
        if self.overlay.retire(id) {
            debug!("推送确认退役乐观条目: id={}", id);
        }

        match event {
            RealtimeEvent::Insert(record) => handler.on_insert(record),
            RealtimeEvent::Update(record) => handler.on_update(record),
            RealtimeEvent::Delete { id } => handler.on_delete(id),
        }

        self.overlay.apply_authoritative(event);
        // 快照落盘失败只影响下次冷启动，内存视图已是最新
        if let Err(e) = self
            .store
            .replace_cache(self.overlay.authoritative_snapshot())
            .await
        {
            warn!("推送事件后写入快照失败: id={}, error={}", id, e);
        }

        if let Some(events) = &self.events {
            events
                .emit(event_builders::realtime_event_applied(id, event.change_name()))
                .await;
        }
    }
}
