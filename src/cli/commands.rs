//! CLI command implementations

use std::path::Path;

use tracing::info;

use crate::bootstrap::build_service;
use crate::config::{ConfigError, ServiceConfig};
use crate::http_server::HttpServer;
use crate::observability::{init_logging, LogFormat};

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve {
            config,
            bind,
            port,
            log_format,
        } => serve(&config, bind, port, log_format),
        Command::CheckConfig { config } => check_config(&config).map(|summary| println!("{}", summary)),
    }
}

fn load_config(path: &Path) -> CliResult<ServiceConfig> {
    ServiceConfig::load(path).map_err(|e| CliError::config_error(e.to_string()))
}

/// Load, override, then serve until Ctrl-C.
pub fn serve(
    config_path: &Path,
    bind: Option<String>,
    port: Option<u16>,
    log_format: Option<LogFormat>,
) -> CliResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(format) = log_format {
        config.logging.format = format;
    }
    config
        .validate()
        .map_err(|errors| CliError::config_error(ConfigError::Invalid(errors).to_string()))?;

    init_logging(config.logging.format);
    info!(config = %config_path.display(), "Starting labgate");

    let service = build_service(&config)
        .map_err(|e| CliError::boot_failed(format!("Failed to load configured state: {}", e)))?;
    let server = HttpServer::new(config.server.socket_addr(), service)
        .with_sweep_interval(config.store.sweep_interval());

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        server
            .start()
            .await
            .map_err(|e| CliError::boot_failed(format!("HTTP server failed: {}", e)))
    })?;

    info!("labgate stopped");
    Ok(())
}

/// Validate a config file and build the service from it without serving.
///
/// Returns a one-line summary of what the file defines.
pub fn check_config(config_path: &Path) -> CliResult<String> {
    let config = load_config(config_path)?;
    build_service(&config)
        .map_err(|e| CliError::boot_failed(format!("Configured state is inconsistent: {}", e)))?;

    Ok(format!(
        "{}: ok ({} groups, {} ACLs, {} resources, listening on {})",
        config_path.display(),
        config.directory.groups.len(),
        config.acls.len(),
        config.resources.len(),
        config.server.socket_addr()
    ))
}
