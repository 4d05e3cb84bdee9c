//! # Observability
//!
//! Logging setup, request spans and slow request tracking.
//!
//! Logs go through `tracing`. The filter is taken from `RUST_LOG` and
//! defaults to `info`.

use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod slow_request;

pub use slow_request::{SlowRequestConfig, SlowRequestEvent, SlowRequestTracker};

static INIT: Once = Once::new();

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines, for collection by a log shipper
    Json,
    /// Human readable, for terminals
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{}' (expected pretty or json)", other)),
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Span for one admission request.
///
/// ```ignore
/// let _guard = admission_span("allocate", "lab", "alice", 42).entered();
/// ```
#[must_use]
pub fn admission_span(operation: &str, acl: &str, user: &str, job: u64) -> Span {
    tracing::info_span!("admission", op = operation, acl = acl, user = user, job = job)
}

/// Span for policy management calls.
#[must_use]
pub fn policy_span(operation: &str, acl: &str) -> Span {
    tracing::info_span!("policy", op = operation, acl = acl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_span_helpers() {
        let span = admission_span("allocate", "lab", "alice", 7);
        let _guard = span.enter();
        tracing::info!("inside admission span");

        let span = policy_span("create_acl", "lab");
        let _guard = span.enter();
        tracing::info!("inside policy span");
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
