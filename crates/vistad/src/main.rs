//! vistad — Vista remote-display channel server.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;

use vista_channel::PixmapCacheRegistry;
use vista_core::VistaConfig;

mod api;
mod dispatch;
mod link;
mod listener;
mod migrate;
mod registry;
mod worker;

use dispatch::WorkerPool;
use listener::ChannelListener;
use migrate::MigrationCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = VistaConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VistaConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VistaConfig::default()
    });
    config.validate().context("invalid configuration")?;
    tracing::info!(
        addr = %config.network.listen_addr,
        port = config.network.port,
        workers = config.workers.count,
        "vistad starting"
    );

    // Shared state
    let connections = registry::new_connection_table();
    let pixmap_caches = PixmapCacheRegistry::new();

    // Shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                let _ = tx.send(());
            }
        });
    }

    // Workers
    let pool = Arc::new(
        WorkerPool::start(&config, pixmap_caches, connections.clone(), shutdown_tx.clone())
            .context("failed to start workers")?,
    );

    // TCP listener
    let tcp = TcpListener::bind((config.network.listen_addr.as_str(), config.network.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.network.listen_addr, config.network.port))?;
    tracing::info!(addr = %tcp.local_addr()?, "listening for channel connections");
    let mut tcp_task = tokio::spawn(ChannelListener::new(pool.clone(), shutdown_tx.subscribe()).run_tcp(tcp));

    // Unix listener
    let mut unix_task = match &config.network.unix_socket {
        Some(path) => {
            // A stale socket from a previous run blocks the bind.
            if path.exists() {
                std::fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
            }
            let unix = UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))?;
            tracing::info!(path = %path.display(), "listening on unix socket");
            tokio::spawn(ChannelListener::new(pool.clone(), shutdown_tx.subscribe()).run_unix(unix))
        }
        None => tokio::spawn(std::future::pending::<Result<()>>()),
    };

    // Operator API
    let mut api_task = if config.network.api_port != 0 {
        let state = api::ApiState {
            connections: connections.clone(),
            pool: pool.clone(),
            coordinator: MigrationCoordinator::new(pool.clone(), connections.clone()),
        };
        tokio::spawn(api::serve(state, config.network.api_port))
    } else {
        tokio::spawn(std::future::pending::<Result<()>>())
    };

    tracing::info!("vistad running");

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        r = &mut tcp_task => tracing::error!(result = ?r, "tcp listener exited"),
        r = &mut unix_task => tracing::error!(result = ?r, "unix listener exited"),
        r = &mut api_task => tracing::error!(result = ?r, "api exited"),
    }

    // Whatever ended the loop, make sure the workers hear about it.
    let _ = shutdown_tx.send(());
    api_task.abort();
    let joiner = pool.clone();
    tokio::task::spawn_blocking(move || joiner.join())
        .await
        .context("failed to join workers")?;
    if let Some(path) = &config.network.unix_socket {
        let _ = std::fs::remove_file(path);
    }

    tracing::info!("vistad stopped");
    Ok(())
}
