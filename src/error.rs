use thiserror::Error;

use crate::store::StoreError;

/// Caller-visible failures. These are never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("stale request: current time {current_time_ms} is {delay_ms}ms behind the clock")]
    StaleRequest { current_time_ms: i64, delay_ms: i64 },
    #[error("unknown constraint: {0}")]
    UnknownConstraint(String),
}

/// System-level failures. `retryable` tells callers whether reissuing the same request
/// (with the same idempotency key) may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InternalError {
    pub message: String,
    pub retryable: bool,
}

impl InternalError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<StoreError> for InternalError {
    fn from(err: StoreError) -> Self {
        let retryable = err.is_retryable();
        Self {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<serde_json::Error> for InternalError {
    fn from(err: serde_json::Error) -> Self {
        Self::fatal(format!("could not decode script response: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl CapacityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CapacityError::Internal(e) if e.retryable)
    }

    pub fn user_error(&self) -> Option<&UserError> {
        match self {
            CapacityError::User(e) => Some(e),
            CapacityError::Internal(_) => None,
        }
    }
}

impl From<StoreError> for CapacityError {
    fn from(err: StoreError) -> Self {
        CapacityError::Internal(err.into())
    }
}

/// Constructor validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    Missing(&'static str),
    #[error("invalid option {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
