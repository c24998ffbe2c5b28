//! Log record model and message template rendering.

use crate::telemetry::propagation::{SpanId, TraceContext, TraceId};
use crate::value::Fields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Log severity, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Level name used by Seq-compatible aggregators
    pub fn clef_name(self) -> &'static str {
        match self {
            Self::Trace => "Verbose",
            Self::Debug => "Debug",
            Self::Info => "Information",
            Self::Warn => "Warning",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" | "verbose" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" | "information" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown severity '{}': must be trace, debug, info, warn or error",
                other
            )),
        }
    }
}

impl From<Severity> for tracing::Level {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Trace => tracing::Level::TRACE,
            Severity::Debug => tracing::Level::DEBUG,
            Severity::Info => tracing::Level::INFO,
            Severity::Warn => tracing::Level::WARN,
            Severity::Error => tracing::Level::ERROR,
        }
    }
}

/// Render a message template such as `"Chat message from {User}"`.
///
/// `{Name}` is replaced by the field's value. The `@`/`$` capture prefixes and
/// `:format`/`,alignment` suffixes are accepted and ignored. Placeholders with
/// no matching field are kept verbatim. `{{` and `}}` are literal braces.
pub fn render_template(template: &str, fields: &Fields) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };

        let token = &tail[1..end];
        let name = token
            .trim_start_matches(['@', '$'])
            .split([':', ','])
            .next()
            .unwrap_or_default();

        match fields.get(name) {
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }

    out.push_str(rest);
    out
}

/// A single structured log event. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    severity: Severity,
    template: String,
    message: String,
    fields: Fields,
    trace_id: Option<TraceId>,
    span_id: Option<SpanId>,
}

impl LogRecord {
    /// Build a record stamped with the current time
    pub fn new(
        severity: Severity,
        template: impl Into<String>,
        fields: Fields,
        correlation: Option<&TraceContext>,
    ) -> Self {
        let template = template.into();
        let message = render_template(&template, &fields);
        Self {
            timestamp: Utc::now(),
            severity,
            template,
            message,
            fields,
            trace_id: correlation.map(TraceContext::trace_id),
            span_id: correlation.map(TraceContext::span_id),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// The template with placeholders filled in
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace_id
    }

    pub fn span_id(&self) -> Option<SpanId> {
        self.span_id
    }
}
