//! # Slow Request Tracking
//!
//! Threshold-based detection of admission requests that held the resource
//! table lock, or waited on the replica, longer than expected. Every slow
//! request is logged; nothing is sampled or aggregated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Slow request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowRequestConfig {
    /// Whether slow request tracking is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Requests taking longer than this are reported
    #[serde(default = "default_threshold_ms")]
    pub threshold_ms: u64,
}

fn default_threshold_ms() -> u64 {
    500
}

impl Default for SlowRequestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_ms: default_threshold_ms(),
        }
    }
}

impl SlowRequestConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_threshold_ms(threshold_ms: u64) -> Self {
        Self {
            enabled: true,
            threshold_ms,
        }
    }
}

/// A request that crossed the threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowRequestEvent {
    pub request_id: Uuid,
    /// Operation name, e.g. `allocate`
    pub operation: String,
    pub acl: Option<String>,
    pub user: Option<String>,
    /// Total time spent in the service
    pub duration_ms: u64,
    /// Part of `duration_ms` spent waiting for the replica
    pub replication_wait_ms: u64,
    pub threshold_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Slow request tracker
#[derive(Debug, Clone, Default)]
pub struct SlowRequestTracker {
    config: SlowRequestConfig,
}

impl SlowRequestTracker {
    pub fn new(config: SlowRequestConfig) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn threshold_ms(&self) -> u64 {
        self.config.threshold_ms
    }

    /// Equal to the threshold is not slow.
    pub fn is_slow(&self, duration_ms: u64) -> bool {
        self.config.enabled && duration_ms > self.config.threshold_ms
    }

    /// Report a finished request. Returns the event when it was slow.
    pub fn observe(
        &self,
        operation: &str,
        acl: Option<&str>,
        user: Option<&str>,
        duration_ms: u64,
        replication_wait_ms: u64,
    ) -> Option<SlowRequestEvent> {
        if !self.is_slow(duration_ms) {
            return None;
        }

        let event = SlowRequestEvent {
            request_id: Uuid::new_v4(),
            operation: operation.to_string(),
            acl: acl.map(str::to_string),
            user: user.map(str::to_string),
            duration_ms,
            replication_wait_ms,
            threshold_ms: self.config.threshold_ms,
            timestamp: Utc::now(),
        };
        warn!(
            request_id = %event.request_id,
            operation = %event.operation,
            acl = ?event.acl,
            user = ?event.user,
            duration_ms,
            replication_wait_ms,
            threshold_ms = event.threshold_ms,
            "slow admission request"
        );
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SlowRequestConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.threshold_ms, 500);
    }

    #[test]
    fn test_disabled_never_slow() {
        let tracker = SlowRequestTracker::disabled();
        assert!(!tracker.is_slow(100_000));
        assert!(tracker.observe("allocate", None, None, 100_000, 0).is_none());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let tracker = SlowRequestTracker::new(SlowRequestConfig::with_threshold_ms(100));
        assert!(!tracker.is_slow(100));
        assert!(tracker.is_slow(101));
    }

    #[test]
    fn test_observe_returns_event() {
        let tracker = SlowRequestTracker::new(SlowRequestConfig::with_threshold_ms(10));
        let event = tracker
            .observe("allocate", Some("lab"), Some("alice"), 250, 200)
            .unwrap();
        assert_eq!(event.operation, "allocate");
        assert_eq!(event.replication_wait_ms, 200);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"duration_ms\":250"));
    }

    #[test]
    fn test_config_from_toml() {
        let config: SlowRequestConfig = toml::from_str("enabled = true").unwrap();
        assert!(config.enabled);
        assert_eq!(config.threshold_ms, 500);
    }
}
