use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coord_server::config::Config;
use coord_server::stdio::StdioServer;
use coord_server::telemetry::{init_telemetry, log_config_validation, log_startup_info};
use database::CoordStore;
use engine::{Coordinator, CoordinatorOptions};
use tool_protocol::ToolHandler;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Workflow-coordination engine for long-running agent sessions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Project root directory (defaults to the working directory)
    #[arg(long, env = "PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Workspace id override
    #[arg(long, env = "COORD_WORKSPACE_ID")]
    workspace_id: Option<String>,

    /// Serve the read-only HTTP mirror on this port
    #[arg(long, env = "COORD_HTTP_PORT")]
    http_port: Option<u16>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(ref id) = cli.workspace_id {
        config.workspace.id = Some(id.clone());
    }
    if let Some(port) = cli.http_port {
        config.http.enabled = true;
        config.http.port = port;
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;
    log_config_validation(&config);
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    let project_root = cli
        .project_root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    log_startup_info(&config, &project_root);

    let store_dir = config.store_dir(&project_root);
    std::fs::create_dir_all(&store_dir)
        .with_context(|| format!("Cannot create store directory {}", store_dir.display()))?;

    let database_path = config.database_path(&project_root);
    let store = match open_store(&database_path).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %database_path.display(), "Store startup failed");
            std::process::exit(2);
        }
    };

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(store),
        CoordinatorOptions {
            project_root,
            store_dir,
            auto_checkpoint: config.hooks.auto_checkpoint,
            security_enabled: config.hooks.security_enabled,
        },
    ));

    coordinator
        .events()
        .subscribe(|event| tracing::debug!(?event, "engine event"));

    if config.http.enabled {
        let mirror = coordinator.clone();
        let port = config.http.port;
        tokio::spawn(async move {
            if let Err(e) = tool_protocol::http::serve(mirror, port).await {
                error!(error = %e, "HTTP mirror failed");
            }
        });
    }

    let server = StdioServer::new(ToolHandler::new(coordinator));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to register SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            }
        }
        #[cfg(windows)]
        {
            tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl+c");
            info!("Received Ctrl+C, shutting down");
        }
        let _ = shutdown_tx.send(());
    });

    tokio::select! {
        result = server.serve() => {
            result.context("stdio transport failed")?;
            info!("Server shut down cleanly");
        }
        _ = shutdown_rx => {
            info!("Shutdown signal received, stopping server");
        }
    }

    Ok(())
}

async fn open_store(database_path: &std::path::Path) -> Result<CoordStore> {
    let store = CoordStore::open(&database_path.display().to_string())
        .await
        .context("Failed to open store")?;
    store.migrate().await.context("Failed to run migrations")?;
    store.health_check().await.context("Store health check failed")?;
    Ok(store)
}
