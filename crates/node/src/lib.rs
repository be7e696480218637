#![forbid(unsafe_code)]

//! Shared bootstrap plumbing for the Loom binaries.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::sync::watch;

/// Installs tracing and the Prometheus sink, then serves the telemetry
/// endpoints in the background when an address is configured.
pub fn init_observability(metrics_addr: Option<SocketAddr>) -> Result<()> {
    loom_telemetry::init::init_tracing().context("tracing init failed")?;
    loom_telemetry::prometheus::install().context("metrics registration failed")?;
    if let Some(addr) = metrics_addr {
        tokio::spawn(loom_telemetry::http::run_server(addr));
    }
    Ok(())
}

/// A shutdown channel flipped on the first SIGINT/SIGTERM.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "node", error = %e, "failed to install signal handler");
            return;
        }
        tracing::info!(target: "node", "shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}
