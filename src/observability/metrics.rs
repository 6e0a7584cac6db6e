//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (leases, node health, blocks, requests, matches)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_pool_leases_total` (counter): leases granted by node
//! - `gateway_pool_lease_failures_total` (counter): lease failures by reason
//! - `gateway_node_health` (gauge): 1=healthy, 0=unhealthy, by node
//! - `gateway_blocks_parsed_total` (counter): parsed blocks by origin
//! - `gateway_block_failures_total` (counter): failed block attempts by origin
//! - `gateway_sync_height` (gauge): last block parsed by origin
//! - `gateway_roi_matches_total` (counter): filter matches by pipeline, direction
//! - `gateway_requests_total` (counter): settlement transitions by outcome
//! - `gateway_deposits_total` (counter): deposit rows saved
//! - `gateway_notifications_total` (counter): publish attempts by outcome
//!
//! # Design Decisions
//! - Free functions over the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are low-cardinality (node names, fixed outcome strings)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter on {}: {}", addr, e))?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_lease(node: &str) {
    metrics::counter!("gateway_pool_leases_total", "node" => node.to_string()).increment(1);
}

pub fn record_lease_failure(reason: &'static str) {
    metrics::counter!("gateway_pool_lease_failures_total", "reason" => reason).increment(1);
}

pub fn record_node_health(node: &str, healthy: bool) {
    metrics::gauge!("gateway_node_health", "node" => node.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_parsed(origin: &'static str, tx_count: usize) {
    metrics::counter!("gateway_blocks_parsed_total", "origin" => origin).increment(1);
    metrics::counter!("gateway_transactions_parsed_total", "origin" => origin)
        .increment(tx_count as u64);
}

pub fn record_block_failure(origin: &'static str) {
    metrics::counter!("gateway_block_failures_total", "origin" => origin).increment(1);
}

pub fn record_sync_height(origin: &'static str, height: f64) {
    metrics::gauge!("gateway_sync_height", "origin" => origin).set(height);
}

pub fn record_roi_match(pipeline: &'static str, outgoing: bool) {
    let direction = if outgoing { "outgoing" } else { "incoming" };
    metrics::counter!("gateway_roi_matches_total", "pipeline" => pipeline, "direction" => direction)
        .increment(1);
}

pub fn record_request_outcome(outcome: &'static str) {
    metrics::counter!("gateway_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_deposit_saved() {
    metrics::counter!("gateway_deposits_total").increment(1);
}

pub fn record_notification(outcome: &'static str) {
    metrics::counter!("gateway_notifications_total", "outcome" => outcome).increment(1);
}
