//! Batched span export
//!
//! Finished spans are buffered in a bounded FIFO and shipped in batches by a
//! single background task:
//!
//! ```text
//! enqueue ──▶ VecDeque<Span> (evict oldest when full)
//!                 │
//!                 ▼  every scheduled_delay, or when a batch is ready
//!            background task ──▶ SpanTransport (retry with backoff)
//! ```
//!
//! `enqueue` never blocks and never waits on the network. A batch that still
//! fails after `max_retries` retries is dropped and one warning is logged.

use crate::config::ExporterConfig;
use crate::logging::StructuredLogger;
use crate::telemetry::span::{ActiveSpan, Span, SpanKind, SpanStatus};
use crate::value::{Fields, Scalar};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid exporter endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Collector rejected batch with status {0}")]
    Rejected(u16),

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ExportError {
    fn from(e: reqwest::Error) -> Self {
        ExportError::Transport(e.to_string())
    }
}

/// Delivers a batch of spans to a collector
#[async_trait]
pub trait SpanTransport: Send + Sync {
    async fn export(&self, batch: &[Span]) -> Result<(), ExportError>;
}

/// Buffering, batching and retry settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterSettings {
    pub max_queue_size: usize,
    pub scheduled_delay: Duration,
    pub max_export_batch_size: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ExporterSettings {
    /// Backoff before retry number `retry` (0-based): doubles each time, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self::from(&ExporterConfig::default())
    }
}

impl From<&ExporterConfig> for ExporterSettings {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size.max(1),
            scheduled_delay: Duration::from_millis(config.scheduled_delay_millis.max(1)),
            max_export_batch_size: config.max_export_batch_size.max(1),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_millis),
            max_backoff: Duration::from_millis(config.max_backoff_millis),
        }
    }
}

/// Result of [`TraceExporter::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest buffered span
    QueuedWithEviction,
    /// The span's trace is not sampled; nothing was queued
    NotSampled,
    /// The exporter has shut down
    Closed,
}

/// Exporter counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExporterStats {
    pub buffered: usize,
    pub exported: u64,
    pub dropped: u64,
    pub evicted: u64,
}

struct Shared {
    settings: ExporterSettings,
    transport: Arc<dyn SpanTransport>,
    logger: Arc<StructuredLogger>,
    buffer: Mutex<VecDeque<Span>>,
    notify: Notify,
    closed: AtomicBool,
    // Serializes drains so batches leave in FIFO order
    export_lock: tokio::sync::Mutex<()>,
    exported: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl Shared {
    fn next_batch(&self) -> Vec<Span> {
        let mut buffer = self.buffer.lock();
        let n = buffer.len().min(self.settings.max_export_batch_size);
        buffer.drain(..n).collect()
    }

    /// Export everything currently buffered, batch by batch
    async fn export_pending(&self) {
        let _guard = self.export_lock.lock().await;
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }
            self.export_with_retry(batch).await;
        }
    }

    async fn export_with_retry(&self, batch: Vec<Span>) {
        let mut retry = 0u32;
        loop {
            match self.transport.export(&batch).await {
                Ok(()) => {
                    self.exported.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    crate::metrics::record_spans("exported", batch.len());
                    tracing::trace!(count = batch.len(), "Exported span batch");
                    return;
                }
                Err(e) if retry < self.settings.max_retries => {
                    let backoff = self.settings.backoff(retry);
                    tracing::debug!(
                        error = %e,
                        retry = retry + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Span export failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    retry += 1;
                }
                Err(e) => {
                    self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    crate::metrics::record_spans("dropped", batch.len());
                    crate::metrics::record_export_batch_failure();
                    self.logger.warn(
                        "Dropped {SpanCount} spans after {Attempts} failed export attempts: {Error}",
                        Fields::new()
                            .with("SpanCount", batch.len())
                            .with("Attempts", u64::from(retry) + 1)
                            .with("Error", e.to_string()),
                        None,
                    );
                    return;
                }
            }
        }
    }
}

/// Buffers finished spans and exports them in the background
pub struct TraceExporter {
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TraceExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceExporter")
            .field("settings", &self.shared.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TraceExporter {
    /// Create the exporter and start its background task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        settings: ExporterSettings,
        transport: Arc<dyn SpanTransport>,
        logger: Arc<StructuredLogger>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::with_capacity(settings.max_queue_size.min(4096))),
            settings,
            transport,
            logger,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            export_lock: tokio::sync::Mutex::new(()),
            exported: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_export_loop(Arc::clone(&shared), shutdown_rx));

        Arc::new(Self {
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Hand a finished span to the exporter
    ///
    /// Unsampled spans are discarded. When the buffer is full the oldest
    /// buffered span is evicted to make room.
    pub fn enqueue(&self, span: Span) -> EnqueueOutcome {
        if !span.is_sampled() {
            crate::metrics::record_spans("not_sampled", 1);
            return EnqueueOutcome::NotSampled;
        }
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_spans("dropped", 1);
            return EnqueueOutcome::Closed;
        }

        let (evicted, len) = {
            let mut buffer = self.shared.buffer.lock();
            let evicted = if buffer.len() >= self.shared.settings.max_queue_size {
                buffer.pop_front().is_some()
            } else {
                false
            };
            buffer.push_back(span);
            (evicted, buffer.len())
        };

        if len >= self.shared.settings.max_export_batch_size {
            self.shared.notify.notify_one();
        }

        if evicted {
            self.shared.evicted.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_spans("evicted", 1);
            EnqueueOutcome::QueuedWithEviction
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Wrap an open span so that it is enqueued when it ends or is dropped
    pub fn track(self: &Arc<Self>, span: ActiveSpan) -> TrackedSpan {
        TrackedSpan {
            span: Some(span),
            exporter: Arc::clone(self),
        }
    }

    /// Export everything buffered now
    pub async fn flush(&self) {
        self.shared.export_pending().await;
    }

    /// Stop accepting spans, export what is buffered and stop the task
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);

        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }

        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Span export task ended abnormally");
                }
            }
            None => self.flush().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &ExporterSettings {
        &self.shared.settings
    }

    pub fn stats(&self) -> ExporterStats {
        ExporterStats {
            buffered: self.shared.buffer.lock().len(),
            exported: self.shared.exported.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
        }
    }
}

async fn run_export_loop(shared: Arc<Shared>, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(shared.settings.scheduled_delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
            _ = shared.notify.notified() => {}
        }
        shared.export_pending().await;
    }

    shared.export_pending().await;
    tracing::debug!("Span export task stopped");
}

/// An open span bound to its exporter
///
/// [`TrackedSpan::end`] seals the span with the given status and enqueues it.
/// A span dropped without being ended (for example because the enclosing
/// future was cancelled) is sealed with [`SpanStatus::Error`], marked
/// `cancelled = true` and enqueued.
#[derive(Debug)]
pub struct TrackedSpan {
    span: Option<ActiveSpan>,
    exporter: Arc<TraceExporter>,
}

impl TrackedSpan {
    pub fn context(&self) -> Option<&crate::telemetry::propagation::TraceContext> {
        self.span.as_ref().map(ActiveSpan::context)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Scalar>) {
        if let Some(span) = self.span.as_mut() {
            span.set_attribute(key, value);
        }
    }

    /// Seal with `status` and hand the span to the exporter
    pub fn end(mut self, status: SpanStatus) -> EnqueueOutcome {
        match self.span.take() {
            Some(span) => self.exporter.enqueue(span.seal(status)),
            None => EnqueueOutcome::Closed,
        }
    }
}

impl Drop for TrackedSpan {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.set_attribute("cancelled", true);
            self.exporter.enqueue(span.seal(SpanStatus::Error));
        }
    }
}

// ============================================================================
// OTLP/HTTP JSON transport
// ============================================================================

/// Posts spans to an OTLP/HTTP collector as JSON (`<endpoint>/v1/traces`)
#[derive(Debug, Clone)]
pub struct HttpSpanTransport {
    client: reqwest::Client,
    url: reqwest::Url,
    service_name: String,
}

impl HttpSpanTransport {
    pub fn new(endpoint: &str, service_name: &str, timeout: Duration) -> Result<Self, ExportError> {
        let url = reqwest::Url::parse(&format!("{}/v1/traces", endpoint.trim_end_matches('/')))
            .map_err(|e| ExportError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url,
            service_name: service_name.to_string(),
        })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

#[async_trait]
impl SpanTransport for HttpSpanTransport {
    async fn export(&self, batch: &[Span]) -> Result<(), ExportError> {
        let payload = encode_otlp(&self.service_name, batch);

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ExportError::Rejected(status.as_u16()))
        }
    }
}

fn otlp_value(value: &Scalar) -> Value {
    match value {
        Scalar::Bool(b) => json!({ "boolValue": b }),
        // int64 values are strings in OTLP JSON
        Scalar::Int(i) => json!({ "intValue": i.to_string() }),
        Scalar::UInt(u) => json!({ "intValue": u.to_string() }),
        Scalar::Float(f) => json!({ "doubleValue": f }),
        Scalar::Str(s) => json!({ "stringValue": s }),
    }
}

fn otlp_attributes(fields: &Fields) -> Vec<Value> {
    fields
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": otlp_value(value) }))
        .collect()
}

fn otlp_kind(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
    }
}

fn otlp_status(status: SpanStatus) -> u8 {
    match status {
        SpanStatus::Unset => 0,
        SpanStatus::Ok => 1,
        SpanStatus::Error => 2,
    }
}

fn unix_nanos(time: chrono::DateTime<chrono::Utc>) -> String {
    time.timestamp_nanos_opt().unwrap_or_default().to_string()
}

/// Build an OTLP `ExportTraceServiceRequest` JSON document
pub fn encode_otlp(service_name: &str, batch: &[Span]) -> Value {
    let spans: Vec<Value> = batch
        .iter()
        .map(|span| {
            let ctx = span.context();
            let mut value = json!({
                "traceId": ctx.trace_id().to_hex(),
                "spanId": ctx.span_id().to_hex(),
                "name": span.name(),
                "kind": otlp_kind(span.kind()),
                "startTimeUnixNano": unix_nanos(span.start_time()),
                "endTimeUnixNano": unix_nanos(span.end_time()),
                "attributes": otlp_attributes(span.attributes()),
                "status": { "code": otlp_status(span.status()) },
            });
            if let Some(parent) = span.parent_span_id() {
                value["parentSpanId"] = Value::String(parent.to_hex());
            }
            if let Some(state) = ctx.trace_state().header_value() {
                value["traceState"] = Value::String(state);
            }
            value
        })
        .collect();

    json!({
        "resourceSpans": [{
            "resource": {
                "attributes": [
                    { "key": "service.name", "value": { "stringValue": service_name } }
                ]
            },
            "scopeSpans": [{
                "scope": { "name": "trace-relay", "version": crate::VERSION },
                "spans": spans,
            }]
        }]
    })
}
