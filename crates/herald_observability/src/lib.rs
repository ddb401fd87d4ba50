//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,herald=debug"));

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on the given address.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Track the number of clients currently connected.
pub fn record_client_connected() {
    metrics::gauge!("herald_client_connections").increment(1.0);
}

pub fn record_client_disconnected() {
    metrics::gauge!("herald_client_connections").decrement(1.0);
}

/// A notification arrived from the upstream server.
pub fn record_notification_received() {
    metrics::counter!("herald_notifications_received_total").increment(1);
}

/// A notification was written to a client socket.
pub fn record_notification_dispatched() {
    metrics::counter!("herald_notifications_dispatched_total").increment(1);
}

pub fn record_listen_executed() {
    metrics::counter!("herald_listens_executed_total").increment(1);
}

pub fn record_unlisten_executed() {
    metrics::counter!("herald_unlistens_executed_total").increment(1);
}

/// A client was evicted because it could not drain its notification inbox.
pub fn record_slow_client_terminated() {
    metrics::counter!("herald_slow_clients_terminated_total").increment(1);
}
