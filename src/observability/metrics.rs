//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, backend
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_active_sessions` (gauge): live sessions by kind
//! - `proxy_backend_health` (gauge): 1=healthy, 0=unhealthy
//! - `proxy_backend_throttled` (gauge): 1 while a backend's gate is closed
//! - `proxy_backend_throttle_edges_total` (counter): gate open/close transitions
//! - `proxy_failovers_total` (counter): connect failures retried in a pool
//! - `proxy_config_reloads_total` (counter): reloads by outcome
//!
//! All recorders are no-ops until [`init_metrics`] installs the exporter,
//! so tests and `--check` runs never touch a global registry.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::load_balancer::endpoint::Endpoint;

/// Install the Prometheus exporter with its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("backend", backend.to_string()),
    ];
    counter!("proxy_requests_total", &labels).increment(1);
    histogram!("proxy_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn session_opened(kind: &'static str) {
    gauge!("proxy_active_sessions", "kind" => kind).increment(1.0);
}

pub fn session_closed(kind: &'static str) {
    gauge!("proxy_active_sessions", "kind" => kind).decrement(1.0);
}

pub fn record_backend_health(endpoint: &Endpoint, healthy: bool) {
    gauge!("proxy_backend_health", "backend" => endpoint.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

/// A backend's throttle gate closed (`true`) or reopened (`false`).
pub fn record_throttle_edge(endpoint: &Endpoint, throttled: bool) {
    let backend = endpoint.to_string();
    let edge = if throttled { "close" } else { "open" };
    counter!("proxy_backend_throttle_edges_total", "backend" => backend.clone(), "edge" => edge)
        .increment(1);
    gauge!("proxy_backend_throttled", "backend" => backend).set(if throttled { 1.0 } else { 0.0 });
}

pub fn record_failover(pool: &str) {
    counter!("proxy_failovers_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_config_reload(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("proxy_config_reloads_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_are_noops_without_exporter() {
        let endpoint = Endpoint::new("127.0.0.1", 80);
        record_request("GET", 200, "127.0.0.1:80", Instant::now());
        record_backend_health(&endpoint, true);
        record_throttle_edge(&endpoint, true);
        record_throttle_edge(&endpoint, false);
        record_failover("web");
        record_config_reload(false);
        session_opened("upstream");
        session_closed("upstream");
    }
}
