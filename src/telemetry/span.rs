//! Span data model.
//!
//! An [`ActiveSpan`] is the open, mutable form owned by the operation that
//! started it. Sealing it produces a [`Span`], which is immutable and is what
//! the exporter queues and ships.

use crate::telemetry::propagation::{SpanId, TraceContext};
use crate::value::{Fields, Scalar};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Status code for a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// No status was set.
    #[default]
    Unset,
    /// The operation completed successfully.
    Ok,
    /// The operation failed or was cancelled.
    Error,
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Kind of span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Internal operation.
    #[default]
    Internal,
    /// Handling of an inbound request.
    Server,
    /// An outbound request.
    Client,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// A span that has started but not ended.
#[derive(Debug)]
pub struct ActiveSpan {
    context: TraceContext,
    parent_span_id: Option<SpanId>,
    name: String,
    kind: SpanKind,
    start_time: DateTime<Utc>,
    started: Instant,
    attributes: Fields,
}

impl ActiveSpan {
    /// Start a span now.
    ///
    /// `context` carries this span's own span id; `parent_span_id` links it to
    /// the span that caused it (`None` for a root span).
    pub fn start(
        name: impl Into<String>,
        kind: SpanKind,
        context: TraceContext,
        parent_span_id: Option<SpanId>,
    ) -> Self {
        Self {
            context,
            parent_span_id,
            name: name.into(),
            kind,
            start_time: Utc::now(),
            started: Instant::now(),
            attributes: Fields::new(),
        }
    }

    /// Start a child of `parent`: same trace, new span id.
    pub fn child_of(name: impl Into<String>, kind: SpanKind, parent: &TraceContext) -> Self {
        Self::start(name, kind, parent.derive_child(), Some(parent.span_id()))
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Scalar>) {
        self.attributes.insert(key, value);
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// End the span. The returned value is immutable.
    pub fn seal(self, status: SpanStatus) -> Span {
        let duration = self.started.elapsed();
        let end_time = self.start_time
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

        Span {
            context: self.context,
            parent_span_id: self.parent_span_id,
            name: self.name,
            kind: self.kind,
            start_time: self.start_time,
            end_time,
            duration,
            attributes: self.attributes,
            status,
        }
    }
}

/// A sealed span: a finished unit of work in a distributed trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    context: TraceContext,
    parent_span_id: Option<SpanId>,
    name: String,
    kind: SpanKind,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration: Duration,
    attributes: Fields,
    status: SpanStatus,
}

impl Span {
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn attributes(&self) -> &Fields {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Scalar> {
        self.attributes.get(key)
    }

    pub fn status(&self) -> SpanStatus {
        self.status
    }

    pub fn is_sampled(&self) -> bool {
        self.context.is_sampled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_keeps_identity_and_attributes() {
        let parent = TraceContext::new_root(true);
        let mut active = ActiveSpan::child_of("POST backend", SpanKind::Client, &parent);
        active.set_attribute("http.status_code", 200u16);
        let span_id = active.context().span_id();

        let span = active.seal(SpanStatus::Ok);

        assert_eq!(span.context().trace_id(), parent.trace_id());
        assert_eq!(span.context().span_id(), span_id);
        assert_eq!(span.parent_span_id(), Some(parent.span_id()));
        assert_eq!(span.status(), SpanStatus::Ok);
        assert_eq!(span.attribute("http.status_code"), Some(&Scalar::UInt(200)));
        assert!(span.end_time() >= span.start_time());
    }

    #[test]
    fn test_root_span_has_no_parent() {
        let root = TraceContext::new_root(false);
        let span = ActiveSpan::start("root", SpanKind::Server, root, None).seal(SpanStatus::Unset);
        assert!(span.parent_span_id().is_none());
        assert!(!span.is_sampled());
    }
}
