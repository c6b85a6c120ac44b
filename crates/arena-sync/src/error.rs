use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    /// 传输层错误（连接/重连失败，按退避策略重试，不致命）
    Transport(String),
    /// 客户端限流：被冷却窗口拦截的调用（静默处理，仅记日志）
    Throttled {
        operation: String,
        retry_after_ms: u64,
    },
    /// 通知动作冲突：目标消息已处于 applied 终态
    ActionConflict(String),
    /// REST 请求失败（尽量携带服务端返回的 message）
    Request {
        status: Option<u16>,
        message: String,
    },
    JsonError(String),
    InvalidArgument(String),
    NotFound(String),
    NotConnected,
    Timeout(String),
    Config(String),
    Other(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Transport(e) => write!(f, "Transport error: {}", e),
            SyncError::Throttled {
                operation,
                retry_after_ms,
            } => write!(
                f,
                "Throttled: {} (retry after {}ms)",
                operation, retry_after_ms
            ),
            SyncError::ActionConflict(e) => write!(f, "Action conflict: {}", e),
            SyncError::Request { status, message } => match status {
                Some(code) => write!(f, "Request error [{}]: {}", code, message),
                None => write!(f, "Request error: {}", message),
            },
            SyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            SyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            SyncError::NotFound(e) => write!(f, "Not found: {}", e),
            SyncError::NotConnected => write!(f, "Not connected"),
            SyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            SyncError::Config(e) => write!(f, "Config error: {}", e),
            SyncError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::JsonError(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SyncError::Timeout(error.to_string())
        } else {
            SyncError::Request {
                status: error.status().map(|s| s.as_u16()),
                message: error.to_string(),
            }
        }
    }
}

impl SyncError {
    /// 判断错误对调用方而言是否属于"良性拒绝"
    ///
    /// 限流拦截与幂等冲突都不应作为异常上抛给用户，
    /// 调用方可据此把它们当成功的 no-op 处理。
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SyncError::Throttled { .. } | SyncError::ActionConflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
