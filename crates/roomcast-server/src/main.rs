//! # roomcast
//!
//! Realtime chat delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory bus, single node)
//! roomcast
//!
//! # Share rooms across processes through Redis
//! REDIS_URL=redis://127.0.0.1:6379/ roomcast   # with [bus] backend = "redis"
//!
//! # Run with environment variables
//! ROOMCAST_PORT=8080 ROOMCAST_HOST=0.0.0.0 JWT_SECRET=... roomcast
//! ```

use anyhow::Result;
use roomcast_server::{config, metrics, run_server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting roomcast on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    run_server(config).await?;

    Ok(())
}
