//! Configuration Validation
//!
//! Checks every configuration value at startup and reports all problems
//! together, each with the offending field and value.

use std::collections::HashSet;
use std::fmt::Display;
use std::net::IpAddr;

use thiserror::Error;

/// One invalid configuration value
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration for '{field}': {message} (value: {value})")]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub message: String,
}

/// Result of config validation
pub type ConfigResult<T> = Result<T, Vec<ConfigValidationError>>;

/// Configuration validator
#[derive(Debug, Default)]
pub struct ConfigValidator {
    errors: Vec<ConfigValidationError>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Record an error for `field`
    pub fn error(&mut self, field: &str, value: impl Display, message: &str) -> &mut Self {
        self.errors.push(ConfigValidationError {
            field: field.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        });
        self
    }

    /// Validate port number (1-65535)
    pub fn validate_port(&mut self, field: &str, port: u16) -> &mut Self {
        if port == 0 {
            self.error(field, port, "Port must be between 1 and 65535");
        }
        self
    }

    /// Validate an IP address to bind to
    pub fn validate_ip(&mut self, field: &str, value: &str) -> &mut Self {
        if value.parse::<IpAddr>().is_err() {
            self.error(field, value, "Value must be an IPv4 or IPv6 address");
        }
        self
    }

    /// Validate range (inclusive)
    pub fn validate_range(&mut self, field: &str, value: u64, min: u64, max: u64) -> &mut Self {
        if value < min || value > max {
            self.error(field, value, &format!("Value must be between {} and {}", min, max));
        }
        self
    }

    /// Validate duration in milliseconds
    pub fn validate_duration_ms(&mut self, field: &str, ms: u64, min_ms: u64, max_ms: u64) -> &mut Self {
        if ms < min_ms || ms > max_ms {
            self.error(
                field,
                format!("{}ms", ms),
                &format!("Duration must be between {}ms and {}ms", min_ms, max_ms),
            );
        }
        self
    }

    /// Validate non-empty string
    pub fn validate_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.error(field, value, "Value cannot be empty");
        }
        self
    }

    /// Validate that no name appears twice
    pub fn validate_unique<'a, I>(&mut self, field: &str, names: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                self.error(field, name, "Name is defined more than once");
            }
        }
        self
    }

    /// Validate that `value` names one of `known`
    pub fn validate_reference(&mut self, field: &str, value: &str, known: &HashSet<&str>) -> &mut Self {
        if !known.contains(value) {
            self.error(field, value, "Reference to an undefined name");
        }
        self
    }

    /// Finish validation and return result
    pub fn finish(self) -> ConfigResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Format validation errors for display
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_validation() {
        let mut v = ConfigValidator::new();
        v.validate_port("port", 8080);
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_port("port", 0);
        assert!(v.finish().is_err());
    }

    #[test]
    fn test_ip_validation() {
        let mut v = ConfigValidator::new();
        v.validate_ip("bind", "0.0.0.0").validate_ip("bind", "::1");
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_ip("bind", "localhost");
        assert!(v.finish().is_err());
    }

    #[test]
    fn test_range_validation() {
        let mut v = ConfigValidator::new();
        v.validate_range("max_polls", 100, 0, 1000);
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_range("max_polls", 2000, 0, 1000);
        let err = v.finish().unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("between"));
    }

    #[test]
    fn test_unique_and_reference() {
        let mut v = ConfigValidator::new();
        v.validate_unique("resources", ["a", "b", "a"]);
        let known: HashSet<&str> = ["lab"].into_iter().collect();
        v.validate_reference("acl", "lab", &known)
            .validate_reference("acl", "perf", &known);

        let errors = v.finish().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].value, "a");
        assert_eq!(errors[1].value, "perf");
    }

    #[test]
    fn test_multiple_errors() {
        let mut v = ConfigValidator::new();
        v.validate_port("port", 0)
            .validate_duration_ms("poll_interval_ms", 0, 1, 60_000)
            .validate_non_empty("name", "");

        assert!(v.has_errors());
        let errors = v.finish().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(format_validation_errors(&errors).lines().count() == 3);
    }
}
