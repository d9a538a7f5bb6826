//! Client-side instrumentation.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host application installs a recorder.

use huddle_core::{ConnectionState, Reconciliation};
use metrics::counter;

/// Metric names.
pub mod names {
    pub const SENDS_TOTAL: &str = "huddle_client_sends_total";
    pub const RECONCILIATIONS_TOTAL: &str = "huddle_client_reconciliations_total";
    pub const STALE_EVENTS_TOTAL: &str = "huddle_client_stale_events_total";
    pub const WRITE_FAILURES_TOTAL: &str = "huddle_client_write_failures_total";
    pub const PRESENCE_ERRORS_TOTAL: &str = "huddle_client_presence_errors_total";
    pub const CONNECTION_TRANSITIONS_TOTAL: &str = "huddle_client_connection_transitions_total";
}

/// Describe client metrics to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::SENDS_TOTAL, "Messages sent optimistically");
    metrics::describe_counter!(
        names::RECONCILIATIONS_TOTAL,
        "Confirmed messages merged into the log, by path and outcome"
    );
    metrics::describe_counter!(
        names::STALE_EVENTS_TOTAL,
        "Events dropped because they belong to an older session"
    );
    metrics::describe_counter!(names::WRITE_FAILURES_TOTAL, "Failed message writes");
    metrics::describe_counter!(
        names::PRESENCE_ERRORS_TOTAL,
        "Failed membership reads and writes"
    );
    metrics::describe_counter!(
        names::CONNECTION_TRANSITIONS_TOTAL,
        "Subscription state changes, by target state"
    );
}

pub fn record_send() {
    counter!(names::SENDS_TOTAL).increment(1);
}

/// Record a merge. `path` is `"feed"`, `"write"` or `"history"`.
pub fn record_reconciliation(path: &'static str, outcome: Reconciliation) {
    let outcome = match outcome {
        Reconciliation::Replaced { .. } => "replaced",
        Reconciliation::Duplicate => "duplicate",
        Reconciliation::Appended { .. } => "appended",
    };
    counter!(names::RECONCILIATIONS_TOTAL, "path" => path, "outcome" => outcome).increment(1);
}

pub fn record_stale_event() {
    counter!(names::STALE_EVENTS_TOTAL).increment(1);
}

pub fn record_write_failure() {
    counter!(names::WRITE_FAILURES_TOTAL).increment(1);
}

/// Record a presence failure. `operation` is `"read"` or `"write"`.
pub fn record_presence_error(operation: &'static str) {
    counter!(names::PRESENCE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_transition(to: ConnectionState) {
    counter!(names::CONNECTION_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}
