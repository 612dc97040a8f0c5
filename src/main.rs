use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

use marten::api;
use marten::config::{Config, ServerConfig};
use marten::RedirectStore;

/// URL shortener service
#[derive(Parser, Debug)]
#[command(name = "marten")]
#[command(about = "Shortens URLs and serves the redirects", long_about = None)]
struct Args {
    /// Address to listen on (host:port)
    #[arg(short = 'a', long = "address")]
    address: Option<String>,

    /// Base URL prepended to generated codes
    #[arg(short = 'b', long = "base-url")]
    base_url: Option<String>,

    /// Journal file for the in-memory backend (empty disables it)
    #[arg(short = 'f', long = "file-storage-path")]
    file_storage_path: Option<String>,

    /// Database connection string; selects the relational backend
    #[arg(short = 'd', long = "database-dsn")]
    database_dsn: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(address) = self.address {
            config.server = ServerConfig::parse_address(&address)?;
        }
        if let Some(base_url) = self.base_url {
            config.shortener.base_url = base_url;
        }
        if let Some(path) = self.file_storage_path {
            config.database.journal_path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(dsn) = self.database_dsn.filter(|d| !d.trim().is_empty()) {
            config.database.set_url(dsn);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = Config::from_env()?;
    Args::parse().apply(&mut config)?;
    info!(
        backend = ?config.database.backend,
        base_url = %config.shortener.base_url,
        "Loaded configuration"
    );

    let store = RedirectStore::open(&config)
        .await
        .context("failed to open redirect store")?
        .with_span(info_span!("redirect_store", backend = ?config.database.backend));
    let store = Arc::new(store);

    let tasks = TaskTracker::new();
    let router = api::create_router(Arc::clone(&store), tasks.clone());

    let addr = config.server.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("🚀 Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.close();
    if !tasks.is_empty() {
        info!(pending = tasks.len(), "Waiting for background deletes");
    }
    tasks.wait().await;

    info!("Server stopped, closing store");
    store.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
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
