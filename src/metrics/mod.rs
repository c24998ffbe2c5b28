//! Metrics module
//!
//! Prometheus counters for the relay, the span exporter, log sinks and
//! outbound calls. Exposed by [`server::MetricsServer`].

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // Relay metrics
    pub static ref RELAY_DELIVERIES: IntCounterVec = register_int_counter_vec!(
        "trace_relay_relay_deliveries_total",
        "Broadcast deliveries per subscriber",
        &["status"]  // "delivered", "failed" or "disconnected"
    ).unwrap();

    pub static ref RELAY_SEND_ATTEMPTS_FAILED: IntCounter = register_int_counter!(
        "trace_relay_relay_send_attempts_failed_total",
        "Individual send attempts that failed or timed out"
    ).unwrap();

    pub static ref RELAY_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "trace_relay_relay_subscribers",
        "Currently connected subscribers"
    ).unwrap();

    // Exporter metrics
    pub static ref SPANS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "trace_relay_spans_total",
        "Spans handled by the exporter",
        &["outcome"]  // "exported", "dropped", "evicted" or "not_sampled"
    ).unwrap();

    pub static ref EXPORT_BATCH_FAILURES: IntCounter = register_int_counter!(
        "trace_relay_export_batch_failures_total",
        "Span batches dropped after exhausting retries"
    ).unwrap();

    // Logging metrics
    pub static ref SINK_FAILURES: IntCounterVec = register_int_counter_vec!(
        "trace_relay_log_sink_failures_total",
        "Log sink emit failures",
        &["sink"]
    ).unwrap();

    // Outbound call metrics
    pub static ref OUTBOUND_CALLS: IntCounterVec = register_int_counter_vec!(
        "trace_relay_outbound_calls_total",
        "Outbound HTTP calls",
        &["method", "status"]
    ).unwrap();

    pub static ref OUTBOUND_DURATION: HistogramVec = register_histogram_vec!(
        "trace_relay_outbound_duration_seconds",
        "Outbound HTTP call duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // Chat endpoint metrics
    pub static ref CHAT_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "trace_relay_chat_requests_total",
        "Chat messages received over HTTP",
        &["outcome"]  // "completed", "bad_request" or "failed"
    ).unwrap();
}

/// Record the outcome of one subscriber delivery
pub fn record_relay_delivery(status: &str) {
    RELAY_DELIVERIES.with_label_values(&[status]).inc();
}

/// Record one failed or timed out send attempt
pub fn record_relay_attempt_failure() {
    RELAY_SEND_ATTEMPTS_FAILED.inc();
}

/// Set the connected subscriber count
pub fn set_relay_subscribers(count: usize) {
    RELAY_SUBSCRIBERS.set(count as i64);
}

/// Record spans by exporter outcome
pub fn record_spans(outcome: &str, count: usize) {
    SPANS_TOTAL
        .with_label_values(&[outcome])
        .inc_by(count as u64);
}

/// Record a batch dropped after retries
pub fn record_export_batch_failure() {
    EXPORT_BATCH_FAILURES.inc();
}

/// Record a log sink failure
pub fn record_sink_failure(sink: &str) {
    SINK_FAILURES.with_label_values(&[sink]).inc();
}

/// Record an outbound HTTP call
///
/// # Arguments
/// * `method` - HTTP method
/// * `status` - Status code as text, or "error" for a transport failure
/// * `duration_secs` - Call duration in seconds
pub fn record_outbound_call(method: &str, status: &str, duration_secs: f64) {
    OUTBOUND_CALLS.with_label_values(&[method, status]).inc();
    OUTBOUND_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record a chat request outcome
pub fn record_chat_request(outcome: &str) {
    CHAT_REQUESTS.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_spans_accumulates() {
        let before = SPANS_TOTAL.with_label_values(&["evicted"]).get();
        record_spans("evicted", 3);
        assert!(SPANS_TOTAL.with_label_values(&["evicted"]).get() >= before + 3);
    }

    #[test]
    fn test_record_relay_delivery() {
        record_relay_delivery("delivered");
        record_relay_attempt_failure();
        set_relay_subscribers(2);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_outbound_call() {
        record_outbound_call("POST", "200", 0.012);
        record_outbound_call("POST", "error", 1.5);
        // Just verify it doesn't panic
    }
}
