use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::{Config, LogFormat, LoggingConfig};

/// Initialize the tracing subscriber.
///
/// Logs go to stderr so the stdout JSON-RPC channel stays clean.
pub fn init_telemetry(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level configuration")?;

    let registry = Registry::default().with(env_filter);

    match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);
            registry.with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_span_list(true)
                .flatten_event(true);
            registry.with(fmt_layer).init();
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true);
            registry.with(fmt_layer).init();
        }
    }

    tracing::info!(
        log_level = %config.level,
        log_format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}

/// Log startup information after config resolution.
pub fn log_startup_info(config: &Config, project_root: &std::path::Path) {
    tracing::info!(
        workspace_id = %config.workspace_id(project_root),
        database = %config.database_path(project_root).display(),
        http_mirror = config.http.enabled,
        http_port = config.http.port,
        security_hooks = config.hooks.security_enabled,
        auto_checkpoint = config.hooks.auto_checkpoint,
        "Coordination server starting up"
    );
}

/// Log configuration validation outcome.
pub fn log_config_validation(config: &Config) {
    match config.validate() {
        Ok(()) => tracing::info!("Configuration validation passed"),
        Err(e) => tracing::error!(error = %e, "Configuration validation failed"),
    }
}
