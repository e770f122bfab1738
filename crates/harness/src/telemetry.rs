//! Process-wide logging and metrics setup for harness binaries and suites.

use std::str::FromStr;

/// fmt subscriber filtered by `FLEET_LOG` (default `info`). Later calls are no-ops.
pub fn init_tracing() {
    let env = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

/// Prometheus exporter on `FLEET_METRICS_ADDR` (host:port), when set.
pub fn init_metrics() {
    let Ok(addr) = std::env::var("FLEET_METRICS_ADDR") else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(e) => tracing::warn!(addr = %addr, error = %e, "invalid FLEET_METRICS_ADDR"),
    }
}
