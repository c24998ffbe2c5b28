//! W3C Trace Context Propagation
//!
//! Implements the [W3C Trace Context](https://www.w3.org/TR/trace-context/)
//! header pair for carrying a trace across process boundaries.
//!
//! ## Headers
//!
//! - **traceparent**: `00-{trace-id}-{span-id}-{trace-flags}`
//!   - Example: `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
//!
//! - **tracestate**: optional, `vendor1=value1,vendor2=value2`
//!   - Example: `congo=t61rcWkgMzE,rojo=00f067aa0ba902b7`
//!
//! Parsing never fails loudly: anything malformed yields `None` and the caller
//! treats the request as carrying no context.
//!
//! ## Usage
//!
//! ```
//! use std::collections::HashMap;
//! use trace_relay::telemetry::propagation::{extract_trace_context, inject_trace_context};
//!
//! let mut incoming = HashMap::new();
//! incoming.insert(
//!     "traceparent".to_string(),
//!     "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
//! );
//!
//! let parent = extract_trace_context(&incoming).expect("valid header");
//! let child = parent.derive_child();
//!
//! let mut outgoing = HashMap::new();
//! inject_trace_context(&child, &mut outgoing);
//! assert!(outgoing["traceparent"].starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
//! ```

use hyper::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::fmt;

/// Name of the traceparent header
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Name of the tracestate header
pub const TRACESTATE_HEADER: &str = "tracestate";

/// The only traceparent version this crate understands
pub const SUPPORTED_VERSION: u8 = 0x00;

/// Sampled bit of the trace flags
pub const FLAG_SAMPLED: u8 = 0x01;

/// Upper bound on tracestate list members (W3C limit)
pub const MAX_TRACE_STATE_ENTRIES: usize = 32;

/// Decode exactly `N` bytes from lowercase hex.
///
/// Uppercase digits are rejected: the wire format is lowercase only.
fn decode_lower_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}

/// 16-byte trace identifier, never all-zero
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Build from raw bytes; `None` for the invalid all-zero id
    pub fn from_bytes(bytes: [u8; 16]) -> Option<Self> {
        (bytes != [0u8; 16]).then_some(Self(bytes))
    }

    /// Parse 32 lowercase hex characters
    pub fn from_hex(s: &str) -> Option<Self> {
        decode_lower_hex::<16>(s).and_then(Self::from_bytes)
    }

    /// Generate a random, non-zero trace id
    pub fn random() -> Self {
        loop {
            let bytes: [u8; 16] = rand::random();
            if let Some(id) = Self::from_bytes(bytes) {
                return id;
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The low 8 bytes read as a big-endian integer.
    ///
    /// These are the random bits used for ratio sampling.
    pub fn low_u64(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(low)
    }

    /// Lowercase hex encoding (32 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

/// 8-byte span identifier, never all-zero
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// Build from raw bytes; `None` for the invalid all-zero id
    pub fn from_bytes(bytes: [u8; 8]) -> Option<Self> {
        (bytes != [0u8; 8]).then_some(Self(bytes))
    }

    /// Parse 16 lowercase hex characters
    pub fn from_hex(s: &str) -> Option<Self> {
        decode_lower_hex::<8>(s).and_then(Self::from_bytes)
    }

    /// Generate a random, non-zero span id
    pub fn random() -> Self {
        loop {
            let bytes: [u8; 8] = rand::random();
            if let Some(id) = Self::from_bytes(bytes) {
                return id;
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Lowercase hex encoding (16 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

/// Ordered list of opaque `key=value` tracestate members
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceState(Vec<(String, String)>);

fn is_valid_state_key(key: &str) -> bool {
    let mut bytes = key.bytes();
    let first_ok = matches!(bytes.next(), Some(b'a'..=b'z' | b'0'..=b'9'));
    first_ok
        && key.len() <= 256
        && bytes.all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'*' | b'/' | b'@'))
}

fn is_valid_state_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 256
        && !value.ends_with(' ')
        && value
            .bytes()
            .all(|b| (0x20..=0x7e).contains(&b) && b != b',' && b != b'=')
}

impl TraceState {
    /// Empty trace state
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Parse a tracestate header value.
    ///
    /// Empty members are skipped. Returns `None` if any member is malformed
    /// or a key repeats. Members beyond [`MAX_TRACE_STATE_ENTRIES`] are dropped.
    pub fn parse(value: &str) -> Option<Self> {
        let mut entries: Vec<(String, String)> = Vec::new();

        for member in value.split(',') {
            let member = member.trim_matches(|c| c == ' ' || c == '\t');
            if member.is_empty() {
                continue;
            }

            let (key, val) = member.split_once('=')?;
            if !is_valid_state_key(key) || !is_valid_state_value(val) {
                return None;
            }
            if entries.iter().any(|(k, _)| k == key) {
                return None;
            }
            entries.push((key.to_string(), val.to_string()));
        }

        entries.truncate(MAX_TRACE_STATE_ENTRIES);
        Some(Self(entries))
    }

    /// Add a member in front, replacing any existing member with the same key.
    ///
    /// Returns `None` if the key or value is not valid tracestate syntax.
    pub fn with_entry(&self, key: &str, value: &str) -> Option<Self> {
        if !is_valid_state_key(key) || !is_valid_state_value(value) {
            return None;
        }
        let mut entries = vec![(key.to_string(), value.to_string())];
        entries.extend(self.0.iter().filter(|(k, _)| k != key).cloned());
        entries.truncate(MAX_TRACE_STATE_ENTRIES);
        Some(Self(entries))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Header encoding, `None` when there are no members
    pub fn header_value(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// W3C Trace Context
///
/// Immutable value: deriving a child or changing the sampled flag produces a
/// new context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    version: u8,
    trace_id: TraceId,
    span_id: SpanId,
    flags: u8,
    trace_state: TraceState,
}

impl TraceContext {
    /// Create a context from known identifiers
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            trace_id,
            span_id,
            flags: if sampled { FLAG_SAMPLED } else { 0 },
            trace_state: TraceState::new(),
        }
    }

    /// Mint a fresh root context with random identifiers
    pub fn new_root(sampled: bool) -> Self {
        Self::new(TraceId::random(), SpanId::random(), sampled)
    }

    /// Replace the trace state
    pub fn with_trace_state(mut self, trace_state: TraceState) -> Self {
        self.trace_state = trace_state;
        self
    }

    /// Copy with the sampled flag set or cleared; other flag bits are kept
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        if sampled {
            self.flags |= FLAG_SAMPLED;
        } else {
            self.flags &= !FLAG_SAMPLED;
        }
        self
    }

    /// Parse a traceparent/tracestate header pair.
    ///
    /// Returns `None` on wrong segment count, wrong field lengths, anything
    /// other than lowercase hex, an unsupported version, or all-zero ids.
    /// A malformed tracestate is discarded without rejecting the traceparent.
    pub fn parse(traceparent: &str, tracestate: Option<&str>) -> Option<Self> {
        let traceparent = traceparent.trim_matches(|c| c == ' ' || c == '\t');

        let mut parts = traceparent.split('-');
        let (version, trace_id, span_id, flags) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let [version] = decode_lower_hex::<1>(version)?;
        if version != SUPPORTED_VERSION {
            return None;
        }

        let trace_id = TraceId::from_hex(trace_id)?;
        let span_id = SpanId::from_hex(span_id)?;
        let [flags] = decode_lower_hex::<1>(flags)?;

        let trace_state = tracestate
            .and_then(TraceState::parse)
            .unwrap_or_default();

        Some(Self {
            version,
            trace_id,
            span_id,
            flags,
            trace_state,
        })
    }

    /// Canonical header pair; the tracestate is `None` when empty
    pub fn format(&self) -> (String, Option<String>) {
        (self.to_traceparent(), self.trace_state.header_value())
    }

    /// Format as traceparent header value
    pub fn to_traceparent(&self) -> String {
        format!(
            "{:02x}-{}-{}-{:02x}",
            self.version, self.trace_id, self.span_id, self.flags
        )
    }

    /// Context for an outbound call: same trace, flags and state, new span id
    pub fn derive_child(&self) -> Self {
        Self {
            version: self.version,
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            flags: self.flags,
            trace_state: self.trace_state.clone(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    /// Returns true if the sampled flag (bit 0) is set
    pub fn is_sampled(&self) -> bool {
        (self.flags & FLAG_SAMPLED) != 0
    }
}

/// Extract trace context from a plain header map (case-insensitive names)
///
/// # Returns
///
/// * `Some(TraceContext)` if a valid traceparent header is found
/// * `None` if traceparent is missing or invalid
pub fn extract_trace_context(headers: &HashMap<String, String>) -> Option<TraceContext> {
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    TraceContext::parse(find(TRACEPARENT_HEADER)?, find(TRACESTATE_HEADER))
}

/// Inject trace context into a plain header map
///
/// Writes `traceparent` and, when the trace state is not empty, `tracestate`.
pub fn inject_trace_context(context: &TraceContext, headers: &mut HashMap<String, String>) {
    let (traceparent, tracestate) = context.format();
    headers.insert(TRACEPARENT_HEADER.to_string(), traceparent);
    match tracestate {
        Some(state) => {
            headers.insert(TRACESTATE_HEADER.to_string(), state);
        }
        None => {
            headers.remove(TRACESTATE_HEADER);
        }
    }
}

/// Extract trace context from an HTTP header map.
///
/// Multiple `tracestate` header lines are combined in order.
pub fn extract_from_headers(headers: &HeaderMap) -> Option<TraceContext> {
    let traceparent = headers.get(TRACEPARENT_HEADER)?.to_str().ok()?;

    let state_lines: Vec<&str> = headers
        .get_all(TRACESTATE_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let tracestate = (!state_lines.is_empty()).then(|| state_lines.join(","));

    TraceContext::parse(traceparent, tracestate.as_deref())
}

/// Inject trace context into an HTTP header map, replacing existing values
pub fn inject_into_headers(context: &TraceContext, headers: &mut HeaderMap) {
    let (traceparent, tracestate) = context.format();

    if let Ok(value) = HeaderValue::from_str(&traceparent) {
        headers.insert(TRACEPARENT_HEADER, value);
    }

    headers.remove(TRACESTATE_HEADER);
    if let Some(value) = tracestate.and_then(|s| HeaderValue::from_str(&s).ok()) {
        headers.insert(TRACESTATE_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn test_parse_valid_traceparent() {
        let context = TraceContext::parse(VALID, None).unwrap();
        assert_eq!(context.trace_id().to_hex(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(context.span_id().to_hex(), "b7ad6b7169203331");
        assert_eq!(context.flags(), 0x01);
        assert!(context.is_sampled());
        assert!(context.trace_state().is_empty());
    }

    #[test]
    fn test_parse_rejects_uppercase_hex() {
        let upper = "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01";
        assert!(TraceContext::parse(upper, None).is_none());
    }

    #[test]
    fn test_parse_rejects_zero_ids() {
        let zero_trace = "00-00000000000000000000000000000000-b7ad6b7169203331-01";
        let zero_span = "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01";
        assert!(TraceContext::parse(zero_trace, None).is_none());
        assert!(TraceContext::parse(zero_span, None).is_none());
    }

    #[test]
    fn test_parse_rejects_extra_segments() {
        let extra = format!("{}-00", VALID);
        assert!(TraceContext::parse(&extra, None).is_none());
    }

    #[test]
    fn test_malformed_tracestate_is_dropped_but_context_kept() {
        let context = TraceContext::parse(VALID, Some("bad key=value")).unwrap();
        assert!(context.trace_state().is_empty());
    }

    #[test]
    fn test_tracestate_skips_empty_members() {
        let state = TraceState::parse("congo=t61rcWkgMzE, ,rojo=00f067aa0ba902b7").unwrap();
        assert_eq!(state.entries().len(), 2);
        assert_eq!(state.get("rojo"), Some("00f067aa0ba902b7"));
    }

    #[test]
    fn test_tracestate_rejects_duplicate_keys() {
        assert!(TraceState::parse("a=1,a=2").is_none());
    }

    #[test]
    fn test_tracestate_truncates_to_limit() {
        let header = (0..40)
            .map(|i| format!("k{}=v{}", i, i))
            .collect::<Vec<_>>()
            .join(",");
        let state = TraceState::parse(&header).unwrap();
        assert_eq!(state.entries().len(), MAX_TRACE_STATE_ENTRIES);
        assert_eq!(state.entries()[0].0, "k0");
    }

    #[test]
    fn test_with_entry_moves_key_to_front() {
        let state = TraceState::parse("a=1,b=2").unwrap();
        let updated = state.with_entry("b", "3").unwrap();
        assert_eq!(updated.header_value().unwrap(), "b=3,a=1");
    }

    #[test]
    fn test_with_sampled_returns_new_value() {
        let context = TraceContext::parse(VALID, None).unwrap();
        let unsampled = context.clone().with_sampled(false);

        assert!(context.is_sampled());
        assert!(!unsampled.is_sampled());
        assert_eq!(unsampled.flags(), 0x00);
        assert_eq!(unsampled.trace_id(), context.trace_id());
    }

    #[test]
    fn test_derive_child_keeps_trace_and_state() {
        let parent = TraceContext::parse(VALID, Some("congo=t61rcWkgMzE")).unwrap();
        let child = parent.derive_child();

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_ne!(child.span_id(), parent.span_id());
        assert_eq!(child.flags(), parent.flags());
        assert_eq!(child.trace_state(), parent.trace_state());
    }

    #[test]
    fn test_header_map_roundtrip() {
        let context = TraceContext::parse(VALID, Some("congo=t61rcWkgMzE")).unwrap();
        let mut headers = HeaderMap::new();
        inject_into_headers(&context, &mut headers);

        assert_eq!(headers.get(TRACEPARENT_HEADER).unwrap(), VALID);
        assert_eq!(extract_from_headers(&headers), Some(context));
    }

    #[test]
    fn test_header_map_combines_tracestate_lines() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT_HEADER, HeaderValue::from_static(VALID));
        headers.append(TRACESTATE_HEADER, HeaderValue::from_static("a=1"));
        headers.append(TRACESTATE_HEADER, HeaderValue::from_static("b=2"));

        let context = extract_from_headers(&headers).unwrap();
        assert_eq!(context.trace_state().header_value().unwrap(), "a=1,b=2");
    }
}
