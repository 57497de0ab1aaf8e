//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_transactions_total` (counter): finished transactions by outcome
//! - `proxy_pool_connections_opened_total` (counter): outbound connects
//! - `proxy_pool_connections_reused_total` (counter): idle connections handed out again
//! - `proxy_tunnels_total` (counter): CONNECT and upgrade tunnels by kind
//! - `proxy_active_connections` (gauge): current client connection count
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Prometheus exporter is opt-in and installed by the binary

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_transaction(outcome: &'static str) {
    metrics::counter!("proxy_transactions_total", "outcome" => outcome).increment(1);
}

pub fn record_pool_open() {
    metrics::counter!("proxy_pool_connections_opened_total").increment(1);
}

pub fn record_pool_reuse() {
    metrics::counter!("proxy_pool_connections_reused_total").increment(1);
}

pub fn record_tunnel(kind: &'static str) {
    metrics::counter!("proxy_tunnels_total", "kind" => kind).increment(1);
}

pub fn connection_opened() {
    metrics::gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("proxy_active_connections").decrement(1.0);
}
