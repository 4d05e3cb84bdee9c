//! Resource store errors.
//!
//! Infrastructure failures here abort the request. Changes made under the
//! table lock before the failure are rolled back.

use serde::Serialize;
use thiserror::Error;

/// Resource store errors
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum StoreError {
    /// Store-side bound on waiting for the table lock expired
    #[error("Timed out after {waited_ms}ms waiting for the resource table lock")]
    LockTimeout { waited_ms: u64 },

    /// Backing store cannot be reached or is in a broken state
    #[error("Resource store unavailable: {message}")]
    Unavailable { message: String },

    /// A mutation was attempted without holding the table lock
    #[error("Resource table lock is not held")]
    LockNotHeld,

    /// A nested step failed so the whole section was rolled back
    #[error("Resource table changes were rolled back after a failed step")]
    RolledBack,

    #[error("Resource not found: {name}")]
    NotFound { name: String },

    #[error("Resource already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Invalid resource '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Result type for resource store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::LockTimeout { .. } => 503,
            Self::Unavailable { .. } => 503,
            Self::LockNotHeld => 500,
            Self::RolledBack => 500,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::Invalid { .. } => 400,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Unavailable { .. } => "STORE_UNAVAILABLE",
            Self::LockNotHeld => "LOCK_NOT_HELD",
            Self::RolledBack => "ROLLED_BACK",
            Self::NotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::AlreadyExists { .. } => "RESOURCE_EXISTS",
            Self::Invalid { .. } => "INVALID_RESOURCE",
        }
    }

    /// Infrastructure failures a caller may retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StoreError::LockTimeout { waited_ms: 10 }.status_code(), 503);
        assert_eq!(StoreError::unavailable("down").error_code(), "STORE_UNAVAILABLE");
        assert!(StoreError::unavailable("down").is_retryable());
        assert!(!StoreError::LockNotHeld.is_retryable());
    }
}
