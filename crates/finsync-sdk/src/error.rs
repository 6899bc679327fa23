use thiserror::Error;

/// SDK 统一错误类型
///
/// 四类核心错误与传播策略：
/// - `StorageUnavailable`：本地持久化不可用，致命，离线模式随之关闭
/// - `RemoteOperationFailed`：单条远端调用失败，可恢复，下一轮同步重试
/// - `SyncInProgress`：已有同步在跑，调用方稍后再试或忽略
/// - `ChannelError`：推送通道异常，由重连状态机内部处理，只通过 ConnectionState 暴露
#[derive(Debug, Error)]
pub enum FinsyncError {
    #[error("StorageUnavailable: {0}")]
    StorageUnavailable(String),

    #[error("RemoteOperationFailed: {id} ({operation}): {cause}")]
    RemoteOperationFailed {
        operation: String,
        id: String,
        cause: String,
    },

    #[error("SyncInProgress")]
    SyncInProgress,

    #[error("ChannelError: {0}")]
    ChannelError(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    /// 传输层错误（HTTP 请求发不出去、超时等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 后端明确返回的错误响应
    #[error("Server error [{status}]: {message}")]
    Server { status: u16, message: String },

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for FinsyncError {
    fn from(error: serde_json::Error) -> Self {
        FinsyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FinsyncError {
    fn from(error: std::io::Error) -> Self {
        FinsyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for FinsyncError {
    fn from(error: sled::Error) -> Self {
        FinsyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for FinsyncError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => FinsyncError::Server {
                status: status.as_u16(),
                message: error.to_string(),
            },
            None => FinsyncError::Transport(error.to_string()),
        }
    }
}

impl FinsyncError {
    /// 构造一条远端操作失败
    pub fn remote(operation: &str, id: &str, cause: impl std::fmt::Display) -> Self {
        FinsyncError::RemoteOperationFailed {
            operation: operation.to_string(),
            id: id.to_string(),
            cause: cause.to_string(),
        }
    }

    /// 本地存储层错误：读写队列失败时整个 sync() 中止
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            FinsyncError::StorageUnavailable(_)
                | FinsyncError::Sqlite(_)
                | FinsyncError::Database(_)
                | FinsyncError::KvStore(_)
                | FinsyncError::IO(_)
        )
    }

    /// 是否值得稍后重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FinsyncError::Transport(_)
            | FinsyncError::SyncInProgress
            | FinsyncError::ChannelError(_)
            | FinsyncError::RemoteOperationFailed { .. } => true,
            // 5xx 服务端错误可重试，4xx 客户端错误不重试
            FinsyncError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FinsyncError>;
