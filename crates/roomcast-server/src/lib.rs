//! # roomcast-server
//!
//! Realtime chat delivery gateway.
//!
//! Clients upgrade `GET /api/v1/ws?room_id=<code>&token=<jwt>` (or send the
//! token as `Authorization: Bearer <jwt>`) and exchange JSON text frames.
//! Several server processes share room traffic through the configured bus.

pub mod config;
pub mod gateway;
pub mod metrics;
pub mod socket;

use anyhow::{Context, Result};
use config::{BusBackend, Config};
use gateway::{Collaborators, Gateway};
use roomcast_bus::{Bus, MemoryBus, RedisBus};
use roomcast_core::MemoryStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Build the bus selected by `config`.
///
/// # Errors
///
/// Returns an error if the Redis bus cannot connect.
pub async fn connect_bus(config: &Config) -> Result<Arc<dyn Bus>> {
    match config.bus.backend {
        BusBackend::Memory => Ok(Arc::new(MemoryBus::new())),
        BusBackend::Redis => {
            let bus = RedisBus::connect(&config.bus.redis_url, config.bus.backoff.clone())
                .await
                .context("Failed to connect to Redis bus")?;
            Ok(Arc::new(bus))
        }
    }
}

/// Run the HTTP/WebSocket server until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the bus is unreachable or the listener fails.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let bus = connect_bus(&config).await?;
    let collaborators = Collaborators::in_memory(Arc::new(MemoryStore::new()));
    let gateway = Gateway::new(config.clone(), bus, collaborators);
    let app = gateway::router(gateway.clone());

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("roomcast listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{} (bus: {})",
        addr,
        config.gateway.path,
        gateway.bridge().bus_name()
    );

    let token = gateway.shutdown_token().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            token.cancel();
        })
        .await?;

    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
