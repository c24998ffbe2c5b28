//! Structured, trace-correlated logging
//!
//! [`StructuredLogger`] renders message templates, attaches the active trace
//! and span ids, and dispatches each [`LogRecord`] to its sinks in
//! registration order. Every sink has its own minimum severity. A failing
//! sink never affects the caller or the sinks after it; failures are reported
//! through a [`FailureThrottle`].
//!
//! Scoped fields belong to the current logical operation. While a
//! [`LogScope`] is open, every record logged by that operation carries its
//! fields, whether it goes through the handle or straight through the
//! logger. Dropping the handle removes them. An async operation gets its own
//! scope stack with [`with_operation`]; code outside any operation uses a
//! per-thread stack.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trace_relay::logging::{ConsoleSink, Severity, StructuredLogger};
//! use trace_relay::value::Fields;
//!
//! let logger = Arc::new(
//!     StructuredLogger::builder()
//!         .with_sink(ConsoleSink::new(Severity::Info))
//!         .build(),
//! );
//!
//! let scope = logger.begin_scope(Fields::new().with("Hub", "Chat"));
//! logger.info("hub method invoked", Fields::new(), None);
//! drop(scope);
//! ```

pub mod aggregator;
pub mod record;
pub mod sink;
pub mod subscriber;

pub use aggregator::{AggregatorHandle, AggregatorSink};
pub use record::{render_template, LogRecord, Severity};
pub use sink::{ConsoleSink, FailureThrottle, LogSink, MemorySink, SinkError};
pub use subscriber::{init_subscriber, LoggingError};

use crate::telemetry::propagation::TraceContext;
use crate::value::Fields;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default minimum interval between two failure reports for one sink
pub const DEFAULT_FAILURE_REPORT_INTERVAL: Duration = Duration::from_secs(30);

type ScopeStack = Arc<Mutex<Vec<(u64, Fields)>>>;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static OPERATION_SCOPES: ScopeStack;
}

thread_local! {
    static THREAD_SCOPES: ScopeStack = ScopeStack::default();
}

fn current_scopes() -> ScopeStack {
    OPERATION_SCOPES
        .try_with(Arc::clone)
        .unwrap_or_else(|_| THREAD_SCOPES.with(Arc::clone))
}

/// Fields of every scope currently open on this logical operation, outermost
/// first, later scopes overriding earlier ones
pub fn ambient_fields() -> Fields {
    let scopes = current_scopes();
    let scopes = scopes.lock();
    let mut merged = Fields::new();
    for (_, fields) in scopes.iter() {
        merged.merge(fields);
    }
    merged
}

/// Run `operation` as its own logical operation
///
/// It starts with the scopes open at the call site. Scopes it opens are
/// private to it, so they never leak to other tasks sharing the thread.
pub async fn with_operation<F: Future>(operation: F) -> F::Output {
    let inherited = current_scopes().lock().clone();
    OPERATION_SCOPES
        .scope(Arc::new(Mutex::new(inherited)), operation)
        .await
}

/// Builder for [`StructuredLogger`]
pub struct StructuredLoggerBuilder {
    sinks: Vec<Arc<dyn LogSink>>,
    failure_report_interval: Duration,
}

impl StructuredLoggerBuilder {
    /// Append a sink. Sinks receive records in the order they were added.
    pub fn with_sink<S: LogSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Append a sink that is also held elsewhere (for example a [`MemorySink`]
    /// inspected by a test)
    pub fn with_shared_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn failure_report_interval(mut self, interval: Duration) -> Self {
        self.failure_report_interval = interval;
        self
    }

    pub fn build(self) -> StructuredLogger {
        StructuredLogger {
            sinks: self.sinks,
            throttle: FailureThrottle::new(self.failure_report_interval),
        }
    }
}

/// Dispatches log records to a fixed, ordered set of sinks
pub struct StructuredLogger {
    sinks: Vec<Arc<dyn LogSink>>,
    throttle: FailureThrottle,
}

impl std::fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("StructuredLogger")
            .field("sinks", &names)
            .finish()
    }
}

impl StructuredLogger {
    pub fn builder() -> StructuredLoggerBuilder {
        StructuredLoggerBuilder {
            sinks: Vec::new(),
            failure_report_interval: DEFAULT_FAILURE_REPORT_INTERVAL,
        }
    }

    /// A logger with no sinks; every record is discarded
    pub fn disabled() -> Self {
        Self::builder().build()
    }

    /// Log one record
    ///
    /// Never fails. Sink errors are reported through the failure throttle.
    /// Fields of open scopes are added; call-site fields win on conflict.
    pub fn log(
        &self,
        severity: Severity,
        template: &str,
        fields: Fields,
        correlation: Option<&TraceContext>,
    ) {
        if !self.sinks.iter().any(|s| severity >= s.min_severity()) {
            return;
        }

        let mut merged = ambient_fields();
        merged.merge(&fields);
        let record = LogRecord::new(severity, template, merged, correlation);
        self.dispatch(&record);
    }

    /// Send an already built record to every sink whose threshold it meets
    pub fn dispatch(&self, record: &LogRecord) {
        for sink in &self.sinks {
            if record.severity() < sink.min_severity() {
                continue;
            }
            if let Err(e) = sink.emit(record) {
                self.throttle.report(sink.name(), &e);
            }
        }
    }

    pub fn debug(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Debug, template, fields, correlation);
    }

    pub fn info(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Info, template, fields, correlation);
    }

    pub fn warn(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Warn, template, fields, correlation);
    }

    pub fn error(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Error, template, fields, correlation);
    }

    /// Open a scope on the current logical operation
    ///
    /// Its fields are added to every record the operation logs until the
    /// returned handle is dropped.
    pub fn begin_scope(self: &Arc<Self>, fields: Fields) -> LogScope {
        LogScope::open(Arc::clone(self), current_scopes(), fields)
    }

    /// Run `work` inside a scope. The scope ends when `work` returns, whether
    /// it succeeded or failed.
    pub fn in_scope<T>(self: &Arc<Self>, fields: Fields, work: impl FnOnce(&LogScope) -> T) -> T {
        let scope = self.begin_scope(fields);
        work(&scope)
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

/// Handle for a logging scope
///
/// The scope stays open until the handle is dropped, including when the
/// operation that opened it fails. Fields passed at the call site override
/// scope fields with the same key.
#[derive(Debug)]
pub struct LogScope {
    logger: Arc<StructuredLogger>,
    scopes: ScopeStack,
    id: u64,
    fields: Fields,
}

impl LogScope {
    fn open(logger: Arc<StructuredLogger>, scopes: ScopeStack, fields: Fields) -> Self {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        scopes.lock().push((id, fields.clone()));
        LogScope {
            logger,
            scopes,
            id,
            fields,
        }
    }

    /// Open a nested scope on the same operation; its fields take precedence
    /// over this scope's
    pub fn begin_scope(&self, fields: Fields) -> LogScope {
        let mut merged = self.fields.clone();
        merged.merge(&fields);
        LogScope::open(Arc::clone(&self.logger), Arc::clone(&self.scopes), merged)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn logger(&self) -> &Arc<StructuredLogger> {
        &self.logger
    }

    pub fn log(
        &self,
        severity: Severity,
        template: &str,
        fields: Fields,
        correlation: Option<&TraceContext>,
    ) {
        let mut merged = self.fields.clone();
        merged.merge(&fields);
        self.logger.log(severity, template, merged, correlation);
    }

    pub fn debug(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Debug, template, fields, correlation);
    }

    pub fn info(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Info, template, fields, correlation);
    }

    pub fn warn(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Warn, template, fields, correlation);
    }

    pub fn error(&self, template: &str, fields: Fields, correlation: Option<&TraceContext>) {
        self.log(Severity::Error, template, fields, correlation);
    }
}

impl Drop for LogScope {
    fn drop(&mut self) {
        self.scopes.lock().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl LogSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn min_severity(&self) -> Severity {
            Severity::Trace
        }

        fn emit(&self, _record: &LogRecord) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("always down".into()))
        }
    }

    fn logger_with(sinks: Vec<Arc<dyn LogSink>>) -> Arc<StructuredLogger> {
        let mut builder = StructuredLogger::builder();
        for sink in sinks {
            builder = builder.with_shared_sink(sink);
        }
        Arc::new(builder.build())
    }

    #[test]
    fn test_per_sink_thresholds() {
        let verbose = Arc::new(MemorySink::named("verbose", Severity::Debug));
        let quiet = Arc::new(MemorySink::named("quiet", Severity::Warn));
        let logger = logger_with(vec![verbose.clone(), quiet.clone()]);

        logger.debug("d", Fields::new(), None);
        logger.info("i", Fields::new(), None);
        logger.error("e", Fields::new(), None);

        assert_eq!(verbose.records().len(), 3);
        assert_eq!(quiet.records().len(), 1);
        assert_eq!(quiet.records()[0].template(), "e");
    }

    #[test]
    fn test_failing_sink_does_not_stop_later_sinks() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![Arc::new(FailingSink), memory.clone()]);

        logger.info("still delivered", Fields::new(), None);
        assert_eq!(memory.records().len(), 1);
    }

    #[test]
    fn test_scope_fields_and_call_site_override() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![memory.clone()]);

        let scope = logger.begin_scope(Fields::new().with("Hub", "Chat").with("Method", "outer"));
        let inner = scope.begin_scope(Fields::new().with("Method", "SendMessage"));
        inner.info("invoked", Fields::new(), None);
        inner.info("override", Fields::new().with("Hub", "Other"), None);
        drop(inner);
        drop(scope);
        logger.info("after", Fields::new(), None);

        let records = memory.records();
        assert_eq!(records[0].fields().get("Hub").map(|v| v.to_string()), Some("Chat".into()));
        assert_eq!(
            records[0].fields().get("Method").map(|v| v.to_string()),
            Some("SendMessage".into())
        );
        assert_eq!(records[1].fields().get("Hub").map(|v| v.to_string()), Some("Other".into()));
        assert!(!records[2].fields().contains_key("Hub"));
    }

    #[test]
    fn test_in_scope_ends_after_error() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![memory.clone()]);

        let result: Result<(), &str> = logger.in_scope(Fields::new().with("Hub", "Chat"), |scope| {
            scope.error("failed", Fields::new(), None);
            logger.warn("plain call", Fields::new(), None);
            Err("boom")
        });
        assert!(result.is_err());
        logger.info("after", Fields::new(), None);

        let records = memory.records();
        assert!(records[0].fields().contains_key("Hub"));
        assert!(records[1].fields().contains_key("Hub"));
        assert!(!records[2].fields().contains_key("Hub"));
    }

    #[test]
    fn test_plain_log_call_inside_scope_carries_fields() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![memory.clone()]);

        let scope = logger.begin_scope(Fields::new().with("Hub", "Chat"));
        logger.info("nested call", Fields::new(), None);
        drop(scope);
        logger.info("after", Fields::new(), None);

        let records = memory.records();
        assert_eq!(records[0].fields().get("Hub").map(|v| v.to_string()), Some("Chat".into()));
        assert!(!records[1].fields().contains_key("Hub"));
    }

    #[test]
    fn test_scopes_released_out_of_order() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![memory.clone()]);

        let outer = logger.begin_scope(Fields::new().with("Hub", "Chat"));
        let inner = logger.begin_scope(Fields::new().with("Method", "SendMessage"));
        drop(outer);
        logger.info("inner only", Fields::new(), None);
        drop(inner);

        let records = memory.records();
        assert!(!records[0].fields().contains_key("Hub"));
        assert!(records[0].fields().contains_key("Method"));
        assert!(ambient_fields().is_empty());
    }

    #[tokio::test]
    async fn test_operation_scope_spans_await_points() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![memory.clone()]);

        let inner_logger = Arc::clone(&logger);
        with_operation(async move {
            let _scope = inner_logger.begin_scope(Fields::new().with("RequestPath", "/api/chat/send"));
            tokio::task::yield_now().await;
            inner_logger.info("after await", Fields::new(), None);
        })
        .await;
        logger.info("outside", Fields::new(), None);

        let records = memory.records();
        assert!(records[0].fields().contains_key("RequestPath"));
        assert!(!records[1].fields().contains_key("RequestPath"));
    }

    #[tokio::test]
    async fn test_operation_scopes_do_not_leak_between_tasks() {
        let memory = Arc::new(MemorySink::new(Severity::Trace));
        let logger = logger_with(vec![memory.clone()]);

        let (opened_tx, opened_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let scoped_logger = Arc::clone(&logger);
        let scoped = tokio::spawn(with_operation(async move {
            let _scope = scoped_logger.begin_scope(Fields::new().with("Hub", "Chat"));
            let _ = opened_tx.send(());
            let _ = release_rx.await;
        }));

        opened_rx.await.unwrap();
        let plain_logger = Arc::clone(&logger);
        tokio::spawn(with_operation(async move {
            plain_logger.info("other task", Fields::new(), None);
        }))
        .await
        .unwrap();
        release_tx.send(()).unwrap();
        scoped.await.unwrap();

        assert!(!memory.records()[0].fields().contains_key("Hub"));
    }

    #[test]
    fn test_disabled_logger_discards() {
        let logger = StructuredLogger::disabled();
        logger.error("nothing happens", Fields::new(), None);
        assert!(logger.sink_names().is_empty());
    }
}
