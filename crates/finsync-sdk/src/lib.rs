//! Finsync SDK - 个人记账客户端的离线变更队列与实时对账引擎
//!
//! 本 SDK 提供：
//! - 📦 离线变更持久化：新建 / 修改 / 删除先落盘，网络恢复后按序回放
//! - 🔄 同步引擎：幂等键去重、临时 ID 映射、同一时刻只跑一轮
//! - 🧠 乐观覆盖层：未确认的变更立即反映到列表与汇总
//! - 📡 实时对账：推送事件退役乐观条目，连接断开后有界重连
//! - ⚙️ 事件系统：同步、入队、网络与连接状态变化统一广播
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use finsync_sdk::{Collaborators, FinsyncConfig, FinsyncSDK, NewTransaction, TransactionKind};
//! # use finsync_sdk::realtime::{PushChannel, PushChannelProvider};
//! # #[derive(Debug)]
//! # struct MyPushProvider;
//! # #[async_trait::async_trait]
//! # impl PushChannelProvider for MyPushProvider {
//! #     async fn open_channel(&self, _user_id: &str) -> finsync_sdk::Result<PushChannel> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FinsyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.example.com/v1")
//!         .api_token("token")
//!         .build();
//!
//!     let sdk = FinsyncSDK::initialize(config, Collaborators::new(Arc::new(MyPushProvider))).await?;
//!     sdk.init_session("user123").await?;
//!
//!     let _summary = sdk.subscribe_to_summary(|summary| {
//!         println!("余额: {}", summary.balance);
//!     });
//!
//!     sdk.create_transaction(NewTransaction::new(100.0, TransactionKind::Expense, "food"))
//!         .await?;
//!
//!     if sdk.has_pending_operations().await? {
//!         let result = sdk.manual_sync().await?;
//!         println!("同步结果: {:?}", result);
//!     }
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod events;
pub mod network;
pub mod overlay;
pub mod realtime;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod summary;
pub mod sync;
pub mod task_handle;
pub mod utils;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

// 重新导出核心类型，方便使用
pub use error::{FinsyncError, Result};
pub use events::{EventManager, SDKEvent};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use overlay::{OptimisticOverlay, OverlayEntry};
pub use realtime::{
    ChannelMessage, ConnectionState, ConnectionStatus, NoopRealtimeHandler, PushChannel,
    PushChannelProvider, RealtimeEvent, RealtimeHandler, RealtimeListener, ReconnectConfig,
    Subscription,
};
pub use remote::{HttpRemoteBackend, ListFilters, RemoteBackend};
pub use sdk::{
    Collaborators, EventConfig, FinsyncConfig, FinsyncConfigBuilder, FinsyncSDK,
    HttpClientConfig, SyncConfig,
};
pub use storage::entities::{
    NewTransaction, PendingCounts, PendingKind, PendingMutation, TransactionKind,
    TransactionPatch, TransactionRecord,
};
pub use storage::LocalStore;
pub use summary::{FinancialSummaryCalculator, Summary, SummaryCalculator};
pub use sync::{SyncEngine, SyncResult, SyncedCounts};
pub use task_handle::TaskHandle;
pub use version::{version_line, SDK_VERSION};
