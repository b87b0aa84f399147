//! Prometheus export for client metrics.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder and describe the client metrics.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn init(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    parley_core::metrics::describe();
    info!("Metrics server listening on {}", addr);
    Ok(())
}
