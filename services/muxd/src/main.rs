//! muxd
//!
//! Shares one TCP port between several services. Each connection is
//! matched on its first bytes and forwarded to the service that claims it.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use connmux_muxd::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MUXD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting muxd");
    info!(
        bind_addr = %config.bind_addr,
        route_count = config.routes.len(),
        read_timeout_ms = ?config.read_timeout_ms,
        "Configuration loaded"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    connmux_muxd::run(config, shutdown).await
}
