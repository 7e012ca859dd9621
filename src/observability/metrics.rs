//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_connections_accepted_total` (counter): connections by transport
//! - `relay_handshakes_total` (counter): identification outcomes
//! - `relay_pairings_total` (counter): pairing outcomes
//! - `relay_sessions_active` (gauge): currently paired sessions
//! - `relay_forwarded_bytes_total` (counter): payload bytes relayed
//! - `relay_udp_datagrams_dropped_total` (counter): UDP inbox overflow
//! - `relay_forced_closes_total` (counter): connections abandoned at the drain deadline
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - The Prometheus exporter is optional and owns its own HTTP listener

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::connection::TransportKind;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted(transport: TransportKind) {
    metrics::counter!("relay_connections_accepted_total", "transport" => transport.as_str()).increment(1);
}

pub fn record_handshake(outcome: &'static str) {
    metrics::counter!("relay_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_pairing(outcome: &'static str) {
    metrics::counter!("relay_pairings_total", "outcome" => outcome).increment(1);
}

pub fn session_opened() {
    metrics::gauge!("relay_sessions_active").increment(1.0);
}

pub fn session_closed() {
    metrics::gauge!("relay_sessions_active").decrement(1.0);
}

pub fn record_forwarded_bytes(bytes: usize) {
    metrics::counter!("relay_forwarded_bytes_total").increment(bytes as u64);
}

pub fn record_datagram_dropped() {
    metrics::counter!("relay_udp_datagrams_dropped_total").increment(1);
}

pub fn record_forced_closes(count: usize) {
    metrics::counter!("relay_forced_closes_total").increment(count as u64);
}
