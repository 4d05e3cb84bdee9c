//! # Admission Errors
//!
//! Failures of an admission request. Quota denials and exhausted resources
//! are outcomes, not errors, and live in [`Allocation`](super::Allocation).

use serde::Serialize;
use thiserror::Error;

use crate::acl::AclError;
use crate::replication::GateError;
use crate::resources::StoreError;

/// Admission service errors
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Acl(#[from] AclError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replication(#[from] GateError),

    /// Malformed request from the client
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type for admission operations
pub type AdmissionResult<T> = Result<T, AdmissionError>;

impl AdmissionError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Acl(e) => e.status_code(),
            Self::Store(e) => e.status_code(),
            Self::Replication(_) => 503,
            Self::InvalidRequest(_) => 400,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Acl(e) => e.error_code(),
            Self::Store(e) => e.error_code(),
            Self::Replication(GateError::ReplicaLagTimeout(_)) => "REPLICA_LAG_TIMEOUT",
            Self::Replication(GateError::PositionUnavailable(_)) => "REPLICATION_UNAVAILABLE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Acl(e) => serde_json::to_value(e).ok(),
            Self::Store(e) => serde_json::to_value(e).ok(),
            Self::Replication(GateError::ReplicaLagTimeout(lag)) => serde_json::to_value(lag).ok(),
            _ => None,
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &'static str, status: u16) -> Self {
        Self {
            error: error.into(),
            code,
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }
}

impl From<AdmissionError> for ErrorResponse {
    fn from(err: AdmissionError) -> Self {
        Self {
            error: err.to_string(),
            code: err.error_code(),
            status: err.status_code(),
            details: err.details(),
        }
    }
}
