//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use chord_relay_core::BroadcastReport;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
    pub const SESSIONS_TOTAL: &str = "relay_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const BUS_RECONNECTS_TOTAL: &str = "relay_bus_reconnects_total";
    pub const BROADCAST_SECONDS: &str = "relay_broadcast_seconds";
}

/// Describe all metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Bus messages received, labelled by broadcast outcome"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Frames handed to client sessions"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Per-session delivery failures, labelled by reason"
    );
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of open sessions");
    metrics::describe_counter!(
        names::BUS_RECONNECTS_TOTAL,
        "Bus subscriptions re-established after a disconnect"
    );
    metrics::describe_histogram!(
        names::BROADCAST_SECONDS,
        "Time to decode and fan out one bus message"
    );

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

/// Record the outcome of one broadcast.
pub fn record_broadcast(report: &BroadcastReport, elapsed: Duration) {
    counter!(names::MESSAGES_TOTAL, "outcome" => report.outcome()).increment(1);
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    for failure in &report.failures {
        counter!(names::DELIVERY_FAILURES_TOTAL, "reason" => failure.reason()).increment(1);
    }
    histogram!(names::BROADCAST_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a re-established bus subscription.
pub fn record_bus_reconnect() {
    counter!(names::BUS_RECONNECTS_TOTAL).increment(1);
}

fn record_session_opened() {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

fn record_session_closed() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Metrics guard that records session close on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording an opened session.
    #[must_use]
    pub fn new() -> Self {
        record_session_opened();
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        record_session_closed();
    }
}
