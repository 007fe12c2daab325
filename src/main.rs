//! Gyre proxy server entry point

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod database;
mod error;
mod models;
mod proxy;
mod repository;

use config::Config;
use database::Database;
use proxy::ProxyServer;
use repository::{
    RequestLogRepository, RequestLogStore, SettingsRepository, SettingsStore, UpstreamRepository,
    UpstreamStore,
};

#[tokio::main]
async fn main() -> error::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gyre=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gyre proxy server");

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let db = Database::new(&config).await?;
    info!("Connected to database");

    let upstream_store: Arc<dyn UpstreamStore> =
        Arc::new(UpstreamRepository::new(db.pool().clone()));
    let request_log: Arc<dyn RequestLogStore> =
        Arc::new(RequestLogRepository::new(db.pool().clone()));
    let settings_store: Arc<dyn SettingsStore> =
        Arc::new(SettingsRepository::new(db.pool().clone()));

    let server = ProxyServer::build(
        config.listener.clone(),
        config.passthrough.clone(),
        upstream_store,
        request_log,
        settings_store,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("proxy server error: {}", e);
        }
    });

    info!("Proxy listening on {}", config.listener_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;

    db.close().await;
    info!("Gyre proxy server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
