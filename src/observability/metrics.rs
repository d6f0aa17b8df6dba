//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define transport metrics (connections, bytes, backpressure, shutdown)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `transport_connections_opened_total` (counter)
//! - `transport_connections_active` (gauge)
//! - `transport_connections_closed_total` (counter): by outcome
//! - `transport_bytes_sent_total` / `transport_bytes_received_total` (counters)
//! - `transport_write_flush_seconds` (histogram): enqueue → fully sent
//! - `transport_backpressure_events_total` (counter): by state (paused/resumed)
//! - `transport_tls_handshake_failures_total` (counter)
//! - `transport_shutdown_duration_seconds` (histogram)
//! - `transport_shutdown_connections_total` (counter): by outcome (drained/aborted)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed, so library users pay nothing by default

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::time::Instant;

use crate::transport::flow::FlowState;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    ::metrics::describe_gauge!(
        "transport_connections_active",
        "Connections currently open or closing"
    );
    ::metrics::describe_histogram!(
        "transport_write_flush_seconds",
        "Time from enqueue until a write request is fully handed to the OS"
    );
    ::metrics::describe_histogram!(
        "transport_shutdown_duration_seconds",
        "Time from shutdown request until every connection is closed or aborted"
    );

    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn record_connection_opened() {
    ::metrics::counter!("transport_connections_opened_total").increment(1);
    ::metrics::gauge!("transport_connections_active").increment(1.0);
}

/// `outcome` is one of `clean`, `aborted`, `timeout`, or an error kind.
pub fn record_connection_closed(outcome: &'static str) {
    ::metrics::gauge!("transport_connections_active").decrement(1.0);
    ::metrics::counter!("transport_connections_closed_total", "outcome" => outcome).increment(1);
}

pub fn record_bytes_sent(n: usize) {
    ::metrics::counter!("transport_bytes_sent_total").increment(n as u64);
}

pub fn record_bytes_received(n: usize) {
    ::metrics::counter!("transport_bytes_received_total").increment(n as u64);
}

pub fn record_write_flushed(enqueued_at: Instant) {
    ::metrics::histogram!("transport_write_flush_seconds").record(enqueued_at.elapsed().as_secs_f64());
}

pub fn record_backpressure(state: FlowState) {
    let label = match state {
        FlowState::Paused => "paused",
        FlowState::Normal => "resumed",
    };
    ::metrics::counter!("transport_backpressure_events_total", "state" => label).increment(1);
}

pub fn record_handshake_failure() {
    ::metrics::counter!("transport_tls_handshake_failures_total").increment(1);
}

pub fn record_shutdown(elapsed: Duration, drained: usize, aborted: usize) {
    ::metrics::histogram!("transport_shutdown_duration_seconds").record(elapsed.as_secs_f64());
    ::metrics::counter!("transport_shutdown_connections_total", "outcome" => "drained")
        .increment(drained as u64);
    ::metrics::counter!("transport_shutdown_connections_total", "outcome" => "aborted")
        .increment(aborted as u64);
}
