//! Metrics for agent observability
//!
//! OpenTelemetry instruments on the global meter. They are no-ops until
//! [`crate::telemetry::init_telemetry`] installs an OTLP meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for agent metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("cse"));

/// Counter of dispatched behavior messages
///
/// Labels:
/// - `behavior`: create_cluster, update_cluster, delete_cluster, get_kubeconfig, unknown
/// - `result`: succeeded, degraded, failed, replayed, active
pub static BEHAVIOR_DISPATCH_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cse_behavior_dispatch_total")
        .with_description("Total number of behavior messages dispatched")
        .with_unit("{messages}")
        .build()
});

/// Histogram of handler execution time
///
/// Labels:
/// - `behavior`: behavior kind
pub static BEHAVIOR_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cse_behavior_duration_seconds")
        .with_description("Duration of behavior handler execution in seconds")
        .with_unit("s")
        .build()
});

/// Counter of retried operations
///
/// Labels:
/// - `operation`: operation name passed to the retry helper
pub static RETRIES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cse_retries_total")
        .with_description("Total number of retried transient failures")
        .with_unit("{retries}")
        .build()
});

/// Counter of ACL replace-all writes
///
/// Labels:
/// - `written`: true when a write was issued, false when the set already matched
pub static ACL_SYNC_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cse_acl_sync_total")
        .with_description("Total number of ACL synchronizations")
        .with_unit("{syncs}")
        .build()
});

/// Record a dispatch outcome
pub fn record_dispatch(behavior: &str, result: &str) {
    BEHAVIOR_DISPATCH_TOTAL.add(
        1,
        &[
            KeyValue::new("behavior", behavior.to_string()),
            KeyValue::new("result", result.to_string()),
        ],
    );
}

/// Record how long a handler ran
pub fn record_duration(behavior: &str, seconds: f64) {
    BEHAVIOR_DURATION.record(seconds, &[KeyValue::new("behavior", behavior.to_string())]);
}

/// Record a retry of a transient failure
pub fn record_retry(operation: &str) {
    RETRIES_TOTAL.add(1, &[KeyValue::new("operation", operation.to_string())]);
}

/// Record an ACL synchronization
pub fn record_acl_sync(written: bool) {
    ACL_SYNC_TOTAL.add(1, &[KeyValue::new("written", written)]);
}
