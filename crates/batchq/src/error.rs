use crate::job::ErrorObject;
use thiserror::Error;

/// Errors handlers and scripts are allowed to bubble up.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ipc channel closed")]
    ChannelClosed,

    #[error("rpc call `{0}` timed out")]
    RpcTimeout(String),

    #[error("remote error: {}", .0.message)]
    Remote(ErrorObject),

    #[error("unknown rpc method: {0}")]
    UnknownMethod(String),

#[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;
