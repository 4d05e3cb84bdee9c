//! CLI argument definitions using clap
//!
//! Commands:
//! - labgate serve --config <path> [--bind <ip>] [--port <port>] [--log-format <pretty|json>]
//! - labgate check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::observability::LogFormat;

/// labgate - admission control and leasing for shared lab resources
#[derive(Parser, Debug)]
#[command(name = "labgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the admission API server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./labgate.toml")]
        config: PathBuf,

        /// Address to bind to, overriding `server.bind`
        #[arg(long)]
        bind: Option<String>,

        /// Port to bind to, overriding `server.port`
        #[arg(long)]
        port: Option<u16>,

        /// Log output format, overriding `logging.format`
        #[arg(long)]
        log_format: Option<LogFormat>,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./labgate.toml")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["labgate", "serve"]).unwrap();
        match cli.command {
            Command::Serve {
                config,
                bind,
                port,
                log_format,
            } => {
                assert_eq!(config, PathBuf::from("./labgate.toml"));
                assert!(bind.is_none());
                assert!(port.is_none());
                assert!(log_format.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "labgate",
            "serve",
            "--config",
            "/etc/labgate.toml",
            "--port",
            "9000",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Serve {
                config,
                port,
                log_format,
                ..
            } => {
                assert_eq!(config, PathBuf::from("/etc/labgate.toml"));
                assert_eq!(port, Some(9000));
                assert_eq!(log_format, Some(LogFormat::Json));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bad_log_format_rejected() {
        assert!(Cli::try_parse_from(["labgate", "serve", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_check_config() {
        let cli = Cli::try_parse_from(["labgate", "check-config", "--config", "lab.toml"]).unwrap();
        assert!(matches!(cli.command, Command::CheckConfig { .. }));
    }
}
