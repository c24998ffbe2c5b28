//! Distributed tracing
//!
//! W3C Trace Context propagation, head sampling, span recording and batched
//! export to an OTLP/HTTP collector.
//!
//! # Features
//!
//! - `traceparent`/`tracestate` parsing and formatting (version `00`)
//! - Parent-based ratio sampling
//! - Bounded span buffer with drop-oldest eviction
//! - Batch export with exponential backoff retry
//! - Client spans around outbound HTTP calls
//!
//! Context is passed explicitly: every operation that needs it receives an
//! `Option<&TraceContext>`.

pub mod exporter;
pub mod outbound;
pub mod propagation;
pub mod sampling;
pub mod span;

pub use exporter::{
    EnqueueOutcome, ExportError, ExporterSettings, HttpSpanTransport, SpanTransport, TraceExporter,
    TrackedSpan,
};
pub use outbound::{BackendCallError, BackendChatClient, OutboundCallDecorator, TracedHttpClient};
pub use propagation::{SpanId, TraceContext, TraceId, TraceState};
pub use sampling::{InboundContext, Sampler, SamplingDecision};
pub use span::{ActiveSpan, Span, SpanKind, SpanStatus};
