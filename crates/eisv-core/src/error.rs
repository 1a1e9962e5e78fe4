//! Error types for the governance service
//!
//! A fault means the service could not evaluate a request. A reject verdict
//! is not a fault and never travels through this type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock timeout for agent {agent} after {waited_ms}ms")]
    LockTimeout { agent: String, waited_ms: u64 },

    #[error("loop detected: {reason} (retry after {retry_after_secs}s)")]
    LoopDetected {
        reason: String,
        retry_after_secs: u64,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn lock_timeout(agent: impl Into<String>, waited_ms: u64) -> Self {
        Self::LockTimeout {
            agent: agent.into(),
            waited_ms,
        }
    }

    pub fn loop_detected(reason: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::LoopDetected {
            reason: reason.into(),
            retry_after_secs,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure(message.into())
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::LoopDetected { .. }
                | Self::StorageFailure(_)
                | Self::IoError(_)
        )
    }

    /// Faults the store boundary retries transparently before surfacing.
    pub fn is_transient_storage(&self) -> bool {
        matches!(self, Self::StorageFailure(_) | Self::IoError(_))
    }

    /// Stable machine-readable reason string.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LoopDetected { .. } => "loop_detected",
            Self::InvalidState(_) => "invalid_state",
            Self::StorageFailure(_) | Self::IoError(_) => "storage_failure",
            Self::InvalidArgument(_) | Self::JsonError(_) => "invalid_argument",
            Self::Conflict(_) => "conflict",
            Self::MethodNotFound(_) => "method_not_found",
            Self::AuthFailed { .. } => "auth_failed",
            Self::ConfigError(_) => "config_error",
            Self::Internal(_) => "internal",
        }
    }

    /// JSON-RPC error code used on the wire.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::AuthFailed { .. } => -32000,
            Self::NotFound(_) => -32001,
            Self::LockTimeout { .. } => -32010,
            Self::LoopDetected { .. } => -32011,
            Self::InvalidState(_) => -32012,
            Self::StorageFailure(_) | Self::IoError(_) => -32013,
            Self::Conflict(_) => -32014,
            Self::InvalidArgument(_) | Self::JsonError(_) => -32602,
            Self::MethodNotFound(_) => -32601,
            Self::ConfigError(_) | Self::Internal(_) => -32603,
        }
    }

    /// Seconds after which a retry may succeed, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::LoopDetected {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
