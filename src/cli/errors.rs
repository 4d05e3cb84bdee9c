//! CLI error types

use thiserror::Error;

/// Failure category, used for the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration missing, unparsable or invalid
    ConfigError,
    /// Service could not be assembled or the server failed
    BootFailed,
}

impl CliErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::BootFailed => "BOOT_FAILED",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError => 2,
            Self::BootFailed => 1,
        }
    }
}

/// CLI error
#[derive(Debug, Error)]
#[error("{}: {message}", code.as_str())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn config_error(message: impl Into<String>) -> Self {
        Self {
            code: CliErrorCode::ConfigError,
            message: message.into(),
        }
    }

    pub fn boot_failed(message: impl Into<String>) -> Self {
        Self {
            code: CliErrorCode::BootFailed,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type CliResult<T> = Result<T, CliError>;
