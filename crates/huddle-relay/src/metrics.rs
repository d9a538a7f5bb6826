//! Metrics collection and export for the Huddle relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_relay_connections_active";
    pub const FRAMES_TOTAL: &str = "huddle_relay_frames_total";
    pub const FRAME_BYTES: &str = "huddle_relay_frame_bytes";
    pub const SUBSCRIPTIONS_TOTAL: &str = "huddle_relay_subscriptions_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "huddle_relay_subscriptions_active";
    pub const STORE_OPERATIONS_TOTAL: &str = "huddle_relay_store_operations_total";
    pub const LATENCY_SECONDS: &str = "huddle_relay_latency_seconds";
    pub const ERRORS_TOTAL: &str = "huddle_relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since relay start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAME_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of feed subscriptions"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of feed subscriptions"
    );
    metrics::describe_counter!(
        names::STORE_OPERATIONS_TOTAL,
        "Store requests served, by operation"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound message processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an opened subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).increment(1.0);
}

/// Record closed subscriptions.
pub fn record_unsubscription(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).decrement(count as f64);
}

/// Record a store request.
pub fn record_store_operation(operation: &'static str) {
    counter!(names::STORE_OPERATIONS_TOTAL, "operation" => operation).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
