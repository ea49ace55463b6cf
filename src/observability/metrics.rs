//! Metrics collection and exposition.
//!
//! # Metrics
//! - `arxon_circuit_transitions_total` (counter): breaker transitions by target status
//! - `arxon_circuit_open` (gauge): 1=open, 0=closed
//! - `arxon_guarded_requests_total` (counter): guarded calls by outcome
//! - `arxon_cache_lookups_total` (counter): cache reads by result
//! - `arxon_dedup_joined_total` (counter): callers that joined an in-flight request
//! - `arxon_recovery_outcomes_total` (counter): recovery resolutions by result and path

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_circuit_transition(to: &'static str) {
    counter!("arxon_circuit_transitions_total", "to" => to).increment(1);
    gauge!("arxon_circuit_open").set(if to == "down" { 1.0 } else { 0.0 });
}

pub fn record_guarded_request(outcome: &'static str) {
    counter!("arxon_guarded_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("arxon_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_dedup_joined() {
    counter!("arxon_dedup_joined_total").increment(1);
}

pub fn record_recovery_outcome(result: &'static str, path: &'static str) {
    counter!("arxon_recovery_outcomes_total", "result" => result, "path" => path).increment(1);
}
