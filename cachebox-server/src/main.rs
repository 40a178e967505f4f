//! Reference HTTP cache server for cachebox.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cachebox_core::CacheCoordinator;
use cachebox_server::{create_router, AppState, ServerConfig};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cachebox-server")]
#[command(about = "Reference HTTP cache server for cachebox")]
struct Cli {
    /// Path to a cachebox.toml selecting the storage backend
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage directory for artifacts (filesystem backend, ignored with --config)
    #[arg(long, default_value = "./cache")]
    storage_dir: PathBuf,

    /// Maximum artifact size in bytes
    #[arg(long)]
    max_size: Option<u64>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port number
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServerConfig::new().with_storage_dir(&cli.storage_dir),
    };
    if let Some(max_size) = cli.max_size {
        config = config.with_max_artifact_size(max_size);
    }
    config = config.with_bind_address(&cli.bind).with_port(cli.port);

    let coordinator = Arc::new(CacheCoordinator::from_config(&config.cache)?);

    info!("Starting cachebox-server");
    info!("Storage backend: {}", coordinator.provider().name());
    match config.cache.cache.max_artifact_size {
        Some(limit) => info!("Max artifact size: {} bytes", limit),
        None => info!("Max artifact size: unlimited"),
    }
    info!("Listening on {}", config.bind_addr());

    let app = create_router(AppState::new(Arc::clone(&coordinator)));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
