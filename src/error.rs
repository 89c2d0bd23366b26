//! Error types for scenes, stores and the batched RPC transport.

use thiserror::Error;

/// A scene used outside of its single execution lifecycle.
///
/// Usage errors are always fatal to the caller and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("should call scene.execute to enter executing status")]
    NotStarted,

    #[error("scene can not be reused, do not save it persistently")]
    Reused,

    #[error("scene is already executing")]
    AlreadyExecuting,
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Record has no id: {0}")]
    MissingId(String),

    #[error("Unsupported store operation: {0}")]
    Unsupported(String),

    #[error("Invalid store arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },
}

/// Errors raised by the batched RPC client and server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("RPC response did not contain a result for job {0}")]
    MissingResult(usize),

    #[error("Failed to decode RPC payload: {0}")]
    Decode(String),

    #[error("operation {0} not found")]
    OperationNotFound(String),

    #[error("failed to load operation {name}: {reason}")]
    OperationLoad { name: String, reason: String },

    #[error("do not know how to route service {0}")]
    UnknownRoute(String),

    #[error("target tenantName is unknown")]
    UnknownTenant,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum SceneError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Error reported by a remote job. Only the message crosses the process boundary.
    #[error("{0}")]
    Remote(String),

    #[error("atom change rejected by read-only scene: {0}")]
    ReadOnly(String),

    #[error("Subscriber failed: {0}")]
    Subscriber(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SceneError {
    pub fn is_usage(&self) -> bool {
        matches!(self, SceneError::Usage(_))
    }
}

impl From<config::ConfigError> for SceneError {
    fn from(err: config::ConfigError) -> Self {
        SceneError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            RpcError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else if err.is_timeout() {
            RpcError::Transport(format!("Request timeout: {}", err))
        } else if err.is_connect() {
            RpcError::Transport(format!("Connection error: {}", err))
        } else {
            RpcError::Transport(err.to_string())
        }
    }
}
