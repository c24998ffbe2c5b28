//! Log sinks and failure throttling.

use crate::logging::record::{LogRecord, Severity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// tracing target used for records written by [`ConsoleSink`]
pub const CONSOLE_TARGET: &str = "trace_relay::log";

/// Sink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink write failed: {0}")]
    Write(String),
}

/// A destination for log records
///
/// `emit` must not block on I/O; sinks that talk to the network queue
/// records and deliver them from a background task.
pub trait LogSink: Send + Sync {
    /// Stable name used in failure reports and metrics
    fn name(&self) -> &str;

    /// Records below this severity are not sent to the sink
    fn min_severity(&self) -> Severity;

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError>;
}

/// Writes records through the process-wide `tracing` subscriber
///
/// Formatting (human-readable or JSON) is decided by the subscriber installed
/// with [`crate::logging::subscriber::init_subscriber`].
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    min_severity: Severity,
}

impl ConsoleSink {
    pub fn new(min_severity: Severity) -> Self {
        Self { min_severity }
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let trace_id = record.trace_id().map(|id| id.to_hex());
        let span_id = record.span_id().map(|id| id.to_hex());
        let fields = serde_json::to_string(record.fields())
            .map_err(|e| SinkError::Write(e.to_string()))?;
        let message = record.message();

        match record.severity() {
            Severity::Trace => tracing::trace!(
                target: CONSOLE_TARGET,
                trace_id = trace_id.as_deref(),
                span_id = span_id.as_deref(),
                fields = %fields,
                "{}",
                message
            ),
            Severity::Debug => tracing::debug!(
                target: CONSOLE_TARGET,
                trace_id = trace_id.as_deref(),
                span_id = span_id.as_deref(),
                fields = %fields,
                "{}",
                message
            ),
            Severity::Info => tracing::info!(
                target: CONSOLE_TARGET,
                trace_id = trace_id.as_deref(),
                span_id = span_id.as_deref(),
                fields = %fields,
                "{}",
                message
            ),
            Severity::Warn => tracing::warn!(
                target: CONSOLE_TARGET,
                trace_id = trace_id.as_deref(),
                span_id = span_id.as_deref(),
                fields = %fields,
                "{}",
                message
            ),
            Severity::Error => tracing::error!(
                target: CONSOLE_TARGET,
                trace_id = trace_id.as_deref(),
                span_id = span_id.as_deref(),
                fields = %fields,
                "{}",
                message
            ),
        }

        Ok(())
    }
}

/// Keeps records in memory
///
/// Useful for tests and for inspecting what a component logged.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    min_severity: Severity,
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new(min_severity: Severity) -> Self {
        Self::named("memory", min_severity)
    }

    pub fn named(name: &str, min_severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            min_severity,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything emitted so far, in emission order
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records whose template matches exactly
    pub fn find(&self, template: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.template() == template)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Debug)]
struct ThrottleState {
    last_reported: Instant,
    suppressed: u64,
}

/// Rate-limits sink failure reports
///
/// At most one report per sink per interval reaches the fallback console.
/// Failures in between are counted and the count is attached to the next
/// report.
#[derive(Debug)]
pub struct FailureThrottle {
    interval: Duration,
    state: Mutex<HashMap<String, ThrottleState>>,
}

impl FailureThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure; returns true if it was written to the fallback console
    pub fn report(&self, sink: &str, error: &SinkError) -> bool {
        crate::metrics::record_sink_failure(sink);

        let now = Instant::now();
        let mut state = self.state.lock();

        let suppressed = match state.get_mut(sink) {
            Some(entry) if now.duration_since(entry.last_reported) < self.interval => {
                entry.suppressed += 1;
                return false;
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_reported = now;
                entry.suppressed = 0;
                suppressed
            }
            None => {
                state.insert(
                    sink.to_string(),
                    ThrottleState {
                        last_reported: now,
                        suppressed: 0,
                    },
                );
                0
            }
        };
        drop(state);

        tracing::warn!(
            sink = sink,
            suppressed_failures = suppressed,
            error = %error,
            "Log sink failed; records for this sink are being lost"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Fields;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new(Severity::Trace);
        for i in 0..3u64 {
            let record = LogRecord::new(Severity::Info, "n={N}", Fields::new().with("N", i), None);
            sink.emit(&record).unwrap();
        }
        let messages: Vec<_> = sink.records().iter().map(|r| r.message().to_string()).collect();
        assert_eq!(messages, vec!["n=0", "n=1", "n=2"]);
    }

    #[test]
    fn test_console_sink_never_fails() {
        let sink = ConsoleSink::new(Severity::Info);
        let record = LogRecord::new(Severity::Error, "boom", Fields::new(), None);
        assert!(sink.emit(&record).is_ok());
    }

    #[test]
    fn test_throttle_reports_once_per_interval() {
        let throttle = FailureThrottle::new(Duration::from_secs(60));
        let error = SinkError::Unavailable("down".into());

        assert!(throttle.report("aggregator", &error));
        assert!(!throttle.report("aggregator", &error));
        assert!(!throttle.report("aggregator", &error));
        // Each sink is throttled independently
        assert!(throttle.report("other", &error));
    }

    #[test]
    fn test_throttle_reports_again_after_interval() {
        let throttle = FailureThrottle::new(Duration::ZERO);
        let error = SinkError::Write("x".into());
        assert!(throttle.report("s", &error));
        assert!(throttle.report("s", &error));
    }
}
