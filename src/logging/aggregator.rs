//! Seq-compatible log aggregator sink
//!
//! Records are encoded as CLEF (compact log event format), one JSON object
//! per line, and posted to `<endpoint>/api/events/raw?clef` by a single
//! background task. `emit` only enqueues; it never waits on the network.
//!
//! ```text
//! emit ──try_send──▶ bounded mpsc ──▶ worker task ──POST──▶ aggregator
//!                                          │
//!                                          └── health flag (read by emit)
//! ```

use crate::logging::record::{LogRecord, Severity};
use crate::logging::sink::{LogSink, SinkError};
use crate::logging::subscriber::LoggingError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Content type for newline-delimited CLEF
pub const CLEF_CONTENT_TYPE: &str = "application/vnd.serilog.clef";

/// Most records sent in one request
const MAX_LINES_PER_REQUEST: usize = 256;

/// Encode one record as a CLEF line
///
/// Reserved properties use the `@` prefix. A field whose name already starts
/// with `@` is escaped by doubling it.
pub fn encode_clef(record: &LogRecord) -> Result<String, serde_json::Error> {
    let mut event = Map::new();
    event.insert("@t".into(), Value::String(record.timestamp().to_rfc3339()));
    event.insert("@mt".into(), Value::String(record.template().to_string()));
    event.insert("@m".into(), Value::String(record.message().to_string()));
    event.insert(
        "@l".into(),
        Value::String(record.severity().clef_name().to_string()),
    );
    if let Some(trace_id) = record.trace_id() {
        event.insert("@tr".into(), Value::String(trace_id.to_hex()));
    }
    if let Some(span_id) = record.span_id() {
        event.insert("@sp".into(), Value::String(span_id.to_hex()));
    }

    for (key, value) in record.fields().iter() {
        let key = if key.starts_with('@') {
            format!("@{}", key)
        } else {
            key.clone()
        };
        event.insert(key, serde_json::to_value(value)?);
    }

    serde_json::to_string(&Value::Object(event))
}

#[derive(Debug)]
struct Health {
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Health {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }

    fn mark_ok(&self) {
        self.healthy.store(true, Ordering::Release);
        *self.last_error.lock() = None;
    }

    fn mark_failed(&self, error: String) {
        *self.last_error.lock() = Some(error);
        self.healthy.store(false, Ordering::Release);
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.healthy.load(Ordering::Acquire) {
            return Ok(());
        }
        let reason = self
            .last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "last delivery failed".to_string());
        Err(SinkError::Unavailable(reason))
    }
}

/// Sink that ships records to a Seq-compatible aggregator
#[derive(Debug)]
pub struct AggregatorSink {
    min_severity: Severity,
    tx: mpsc::Sender<String>,
    health: Arc<Health>,
}

/// Lifecycle handle for the aggregator's delivery task
///
/// Call [`AggregatorHandle::shutdown`] on exit to deliver queued records.
#[derive(Debug)]
pub struct AggregatorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AggregatorHandle {
    /// Deliver what is queued, then stop the task
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Aggregator delivery task ended abnormally");
            }
        }
    }
}

impl AggregatorSink {
    /// Start the delivery task and return the sink with its handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        endpoint: &str,
        min_severity: Severity,
        queue_capacity: usize,
        timeout: Duration,
    ) -> Result<(Self, AggregatorHandle), LoggingError> {
        let base = endpoint.trim_end_matches('/');
        let url = reqwest::Url::parse(&format!("{}/api/events/raw?clef", base))
            .map_err(|e| LoggingError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let health = Arc::new(Health::new());

        let worker = Worker {
            client,
            url,
            health: Arc::clone(&health),
        };
        let task = tokio::spawn(worker.run(rx, shutdown_rx));

        tracing::debug!(endpoint = %base, queue_capacity, "Aggregator sink started");

        Ok((
            Self {
                min_severity,
                tx,
                health,
            },
            AggregatorHandle {
                shutdown_tx: Some(shutdown_tx),
                task: Some(task),
            },
        ))
    }
}

impl LogSink for AggregatorSink {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let line = encode_clef(record).map_err(|e| SinkError::Write(e.to_string()))?;

        match self.tx.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(SinkError::Unavailable("delivery queue is full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(SinkError::Unavailable("delivery task has stopped".into()))
            }
        }

        // The record is queued, but the aggregator has been failing: surface it
        // so the failure is reported.
        self.health.check()
    }
}

struct Worker {
    client: reqwest::Client,
    url: reqwest::Url,
    health: Arc<Health>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<String>, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                next = rx.recv() => match next {
                    Some(line) => {
                        let mut batch = vec![line];
                        while batch.len() < MAX_LINES_PER_REQUEST {
                            match rx.try_recv() {
                                Ok(line) => batch.push(line),
                                Err(_) => break,
                            }
                        }
                        self.deliver(batch).await;
                    }
                    None => break,
                },
            }
        }

        // Final drain
        rx.close();
        let mut batch = Vec::new();
        while let Ok(line) = rx.try_recv() {
            batch.push(line);
            if batch.len() == MAX_LINES_PER_REQUEST {
                self.deliver(std::mem::take(&mut batch)).await;
            }
        }
        if !batch.is_empty() {
            self.deliver(batch).await;
        }
    }

    async fn deliver(&self, lines: Vec<String>) {
        let count = lines.len();
        let body = lines.join("\n");

        let result = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, CLEF_CONTENT_TYPE)
            .body(body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => self.health.mark_ok(),
            Ok(resp) => {
                self.health
                    .mark_failed(format!("aggregator responded with {}", resp.status()));
                tracing::debug!(status = %resp.status(), count, "Aggregator rejected log batch");
            }
            Err(e) => {
                self.health.mark_failed(e.to_string());
                tracing::debug!(error = %e, count, "Aggregator delivery failed");
            }
        }
    }
}
