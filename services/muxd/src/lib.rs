//! muxd
//!
//! Port-sharing daemon. Connections arriving on one address are matched
//! against the configured routes in order and forwarded to the upstream of
//! the first route that claims them.

pub mod config;
pub mod forward;

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use connmux::Listener;

use crate::config::Config;

/// Bind the shared address and serve every route until `shutdown`
/// resolves or the listener fails.
pub async fn run(config: Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    let mux = Arc::new(
        Listener::bind(config.listener_config())
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?,
    );
    mux.set_read_timeout(config.read_timeout());

    let mut servers = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        info!(
            route = %route.name,
            forward_to = %route.forward_to,
            "Route registered"
        );
        let name: Arc<str> = Arc::from(route.name.as_str());
        let upstream: Arc<str> = Arc::from(route.forward_to.as_str());
        servers.push(mux.serve_async(forward::route_matcher(&route.matcher), move |listener| {
            forward::forward(listener, name, upstream)
        }));
    }
    if servers.is_empty() {
        warn!("No routes configured; every connection will be closed unmatched");
    }

    let serving = mux.serve();
    tokio::pin!(serving);

    let stopping = tokio::select! {
        result = &mut serving => {
            result.context("listener failed")?;
            false
        }
        _ = shutdown => {
            info!("Shutting down");
            mux.close().context("failed to close listener")?;
            true
        }
    };

    if stopping {
        // The listener was closed above; its transport error is expected.
        if let Err(e) = serving.await {
            info!(error = %e, "Listener stopped");
        }
    }

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_listener_closed() => {}
            Ok(Err(e)) => warn!(error = %e, "Route server failed"),
            Err(e) => warn!(error = %e, "Route server panicked"),
        }
    }

    let stats = mux.stats();
    info!(
        accepted = stats.connections_accepted.load(Ordering::Relaxed),
        dispatched = stats.connections_dispatched.load(Ordering::Relaxed),
        unmatched = stats.connections_unmatched.load(Ordering::Relaxed),
        "Stopped"
    );
    Ok(())
}
