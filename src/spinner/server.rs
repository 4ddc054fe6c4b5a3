use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState};
use super::manager::LifecycleManager;
use super::reaper::Reaper;
use crate::config::ProgenyConfig;

/// Configuration for the management server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_host: String,
    pub cleaning_interval_secs: Option<u64>,
    pub cleaning_timeout_secs: Option<u64>,
    pub cleanup_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            public_host: "localhost".to_string(),
            cleaning_interval_secs: None,
            cleaning_timeout_secs: None,
            cleanup_on_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &ProgenyConfig) -> Self {
        let toml = &config.toml;
        Self {
            host: toml.server.host.clone(),
            port: toml.server.port,
            public_host: toml.server.public_host.clone(),
            cleaning_interval_secs: toml.cleaning.interval_secs,
            cleaning_timeout_secs: toml.cleaning.timeout_secs,
            cleanup_on_shutdown: toml.cleaning.cleanup_on_shutdown,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the management server until Ctrl-C.
///
/// The reaper is stopped before the listener drains, and with
/// `cleanup_on_shutdown` every live session is terminated last.
pub async fn start_server(config: ServerConfig, manager: Arc<LifecycleManager>) -> Result<()> {
    let cancel = CancellationToken::new();
    let reaper = Reaper::from_settings(
        manager.clone(),
        config.cleaning_interval_secs,
        config.cleaning_timeout_secs,
    )
    .map(|reaper| reaper.spawn(cancel.child_token()));
    if reaper.is_none() {
        info!("Scheduled cleaning disabled");
    }

    let state = Arc::new(AppState {
        manager: manager.clone(),
        public_host: config.public_host.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let (min, max) = manager.port_range().await;
    info!(%local_addr, port_min = min, port_max = max, "Progeny running");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_cancel.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Some(handle) = reaper
        && let Err(e) = handle.await
    {
        warn!(error = %e, "Reaper task ended abnormally");
    }

    if config.cleanup_on_shutdown {
        match manager.cleanup_all().await {
            Ok(cleaned) => info!(count = cleaned.len(), "Cleaned up all sessions on shutdown"),
            Err(e) => error!(error = %e, "Failed to clean up sessions on shutdown"),
        }
    }

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
