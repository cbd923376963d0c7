// metrics/mod.rs
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Installs the global recorder and serves `/metrics` on `port`.
pub fn setup_metrics(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to setup metrics")?;
    ::metrics::describe_counter!(
        "lanlight_device_errors_total",
        "Failed device operations, labelled by operation"
    );
    ::metrics::describe_gauge!("lanlight_devices", "Lights discovered so far");
    Ok(())
}
