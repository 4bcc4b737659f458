//! Error types for the connection pool

use std::time::Duration;
use thiserror::Error;

use crate::slot::SlotId;

/// Failure to obtain a usable physical connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("failed to open connection: {0}")]
    Open(String),

    #[error("connection rejected by validation after {attempts} attempts")]
    ValidationExhausted { attempts: usize },
}

impl ConnectError {
    /// Convenience constructor for factory implementations
    pub fn open(message: impl Into<String>) -> Self {
        Self::Open(message.into())
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Borrow timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection {id} is not borrowed from this pool: {reason}")]
    InvalidSlot { id: SlotId, reason: &'static str },

    #[error("Pool is closed")]
    PoolClosed,
}

impl PoolError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_converts_into_pool_error() {
        let err: PoolError = ConnectError::open("refused").into();
        assert!(matches!(err, PoolError::Connect(ConnectError::Open(_))));
        assert_eq!(err.to_string(), "failed to open connection: refused");
        assert!(err.is_retryable());
    }

    #[test]
    fn misuse_is_not_retryable() {
        let err = PoolError::InvalidSlot { id: SlotId(7), reason: "revoked" };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("#7"));
        assert!(!PoolError::PoolClosed.is_retryable());
    }
}
