use thiserror::Error;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum ConvSyncError {
    /// 传输层错误（连接失败、读取中断等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 服务端返回非 2xx
    #[error("HTTP error [{status}]: {body}")]
    Http { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 推送帧无法解析
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ConvSyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ConvSyncError::Serialization(error.to_string())
        } else {
            ConvSyncError::Transport(error.to_string())
        }
    }
}

impl From<serde_json::Error> for ConvSyncError {
    fn from(error: serde_json::Error) -> Self {
        ConvSyncError::Serialization(error.to_string())
    }
}

impl ConvSyncError {
    /// 是否为可重试的错误（网络 / 5xx）
    pub fn is_retryable(&self) -> bool {
        match self {
            ConvSyncError::Transport(_) => true,
            ConvSyncError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvSyncError>;
