//! # ACL Errors
//!
//! Error types for policy storage and evaluation.
//!
//! A malformed policy is a [`AclError::Configuration`], never a denial: the
//! caller must be able to tell "policy is broken" from "quota exceeded".

use serde::Serialize;
use thiserror::Error;

use super::model::AclId;

/// ACL error types
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AclError {
    /// ACL not found (by id or name)
    #[error("ACL not found: {acl}")]
    NotFound { acl: String },

    /// ACL name already exists
    #[error("ACL name already exists: {name}")]
    NameExists { name: String },

    /// Invalid ACL name
    #[error("Invalid ACL name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Policy is malformed (bad entry, broken parent chain)
    #[error("Configuration error{}: {reason}", acl_suffix(.acl_id))]
    Configuration {
        acl_id: Option<AclId>,
        reason: String,
    },

    /// ACL cannot be removed while something depends on it
    #[error("ACL {acl_id} is in use: {reason}")]
    InUse { acl_id: AclId, reason: String },

    /// Backing store failure
    #[error("Policy store unavailable: {message}")]
    StoreUnavailable { message: String },
}

fn acl_suffix(acl_id: &Option<AclId>) -> String {
    match acl_id {
        Some(id) => format!(" in ACL {}", id),
        None => String::new(),
    }
}

/// Result type for ACL operations
pub type AclResult<T> = Result<T, AclError>;

impl AclError {
    pub fn not_found(acl: impl ToString) -> Self {
        Self::NotFound {
            acl: acl.to_string(),
        }
    }

    pub fn configuration(acl_id: Option<AclId>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            acl_id,
            reason: reason.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Attach an ACL id to a configuration error raised while loading entries.
    pub fn in_acl(self, id: AclId) -> Self {
        match self {
            Self::Configuration { acl_id: None, reason } => Self::Configuration {
                acl_id: Some(id),
                reason,
            },
            other => other,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::NameExists { .. } => 409,
            Self::InvalidName { .. } => 400,
            Self::Configuration { .. } => 500,
            Self::InUse { .. } => 412,
            Self::StoreUnavailable { .. } => 503,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "ACL_NOT_FOUND",
            Self::NameExists { .. } => "ACL_NAME_EXISTS",
            Self::InvalidName { .. } => "INVALID_ACL_NAME",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::InUse { .. } => "ACL_IN_USE",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AclError::not_found(7);
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.error_code(), "ACL_NOT_FOUND");

        let err = AclError::configuration(Some(AclId(3)), "negative userLimit");
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_configuration_display() {
        let err = AclError::configuration(None, "unknown selector type 'team'");
        assert_eq!(err.to_string(), "Configuration error: unknown selector type 'team'");

        let err = err.in_acl(AclId(4));
        assert_eq!(
            err.to_string(),
            "Configuration error in ACL 4: unknown selector type 'team'"
        );
    }
}
