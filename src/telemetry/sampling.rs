//! Head Sampling
//!
//! Parent-based ratio sampling:
//! - A request that arrives with a trace context keeps the caller's decision,
//!   sampled or not. A trace is never re-sampled part way through.
//! - A request without context starts a new trace, sampled with probability
//!   `ratio`. The decision is derived from the trace id, so evaluating it
//!   twice for the same trace gives the same answer.

use crate::telemetry::propagation::{SpanId, TraceContext, TraceId};

/// Sampling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    /// Record and export this trace
    Sample,
    /// Drop this trace
    Drop,
}

impl SamplingDecision {
    pub fn is_sampled(self) -> bool {
        matches!(self, Self::Sample)
    }
}

impl From<bool> for SamplingDecision {
    fn from(sampled: bool) -> Self {
        if sampled {
            Self::Sample
        } else {
            Self::Drop
        }
    }
}

/// Decide whether a trace is sampled.
///
/// # Arguments
///
/// * `parent` - Upstream context, if the request carried one
/// * `trace_id` - Trace id of the (new) trace, used for the ratio decision
/// * `ratio` - Probability in `[0, 1]` applied when there is no parent
pub fn should_sample(parent: Option<&TraceContext>, trace_id: TraceId, ratio: f64) -> bool {
    if let Some(parent) = parent {
        return parent.is_sampled();
    }

    if ratio >= 1.0 {
        return true;
    }
    if ratio <= 0.0 || ratio.is_nan() {
        return false;
    }

    let threshold = (ratio * u64::MAX as f64) as u64;
    trace_id.low_u64() < threshold
}

/// Result of resolving the context of an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContext {
    /// The request carried a valid context; its decision is kept
    Propagated(TraceContext),
    /// No valid context arrived; a new trace was started
    Minted(TraceContext),
}

impl InboundContext {
    pub fn context(&self) -> &TraceContext {
        match self {
            Self::Propagated(ctx) | Self::Minted(ctx) => ctx,
        }
    }

    pub fn into_context(self) -> TraceContext {
        match self {
            Self::Propagated(ctx) | Self::Minted(ctx) => ctx,
        }
    }

    pub fn is_propagated(&self) -> bool {
        matches!(self, Self::Propagated(_))
    }
}

/// Parent-based ratio sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    ratio: f64,
}

impl Sampler {
    /// Create a new sampler
    ///
    /// # Arguments
    ///
    /// * `ratio` - Sampling rate for new traces, clamped to 0.0..=1.0
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        Self { ratio }
    }

    /// Sample every new trace
    pub fn always_on() -> Self {
        Self::new(1.0)
    }

    /// Sample no new trace (upstream decisions are still honoured)
    pub fn always_off() -> Self {
        Self::new(0.0)
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Determine if a trace should be sampled
    pub fn decide(&self, parent: Option<&TraceContext>, trace_id: TraceId) -> SamplingDecision {
        should_sample(parent, trace_id, self.ratio).into()
    }

    /// Start a new root trace with the sampling decision applied
    pub fn new_root(&self) -> TraceContext {
        let trace_id = TraceId::random();
        let sampled = self.decide(None, trace_id).is_sampled();
        TraceContext::new(trace_id, SpanId::random(), sampled)
    }

    /// Resolve the context for an inbound request.
    ///
    /// An extracted context is returned unchanged; otherwise a new root trace
    /// is minted.
    pub fn resolve_inbound(&self, extracted: Option<TraceContext>) -> InboundContext {
        match extracted {
            Some(ctx) => InboundContext::Propagated(ctx),
            None => InboundContext::Minted(self.new_root()),
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::always_on()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_id_with_low(low: u64) -> TraceId {
        let mut bytes = [0u8; 16];
        bytes[0] = 1;
        bytes[8..].copy_from_slice(&low.to_be_bytes());
        TraceId::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_parent_decision_wins_over_ratio() {
        let sampled = TraceContext::new(TraceId::random(), SpanId::random(), true);
        let unsampled = sampled.clone().with_sampled(false);

        assert!(should_sample(Some(&sampled), TraceId::random(), 0.0));
        assert!(!should_sample(Some(&unsampled), TraceId::random(), 1.0));
    }

    #[test]
    fn test_ratio_bounds() {
        let id = trace_id_with_low(0);
        assert!(!should_sample(None, id, 0.0));
        assert!(!should_sample(None, id, -1.0));
        assert!(should_sample(None, trace_id_with_low(u64::MAX), 1.0));
        assert!(should_sample(None, trace_id_with_low(u64::MAX), 2.5));
    }

    #[test]
    fn test_ratio_uses_low_trace_id_bits() {
        assert!(should_sample(None, trace_id_with_low(10), 0.5));
        assert!(!should_sample(None, trace_id_with_low(u64::MAX - 10), 0.5));
    }

    #[test]
    fn test_decision_is_stable_for_same_trace() {
        let sampler = Sampler::new(0.3);
        let id = TraceId::random();
        let first = sampler.decide(None, id);
        for _ in 0..10 {
            assert_eq!(sampler.decide(None, id), first);
        }
    }

    #[test]
    fn test_new_clamps_ratio() {
        assert_eq!(Sampler::new(4.0).ratio(), 1.0);
        assert_eq!(Sampler::new(-4.0).ratio(), 0.0);
        assert_eq!(Sampler::new(f64::NAN).ratio(), 0.0);
    }

    #[test]
    fn test_resolve_inbound() {
        let sampler = Sampler::always_off();
        let parent = TraceContext::new_root(true);

        let propagated = sampler.resolve_inbound(Some(parent.clone()));
        assert!(propagated.is_propagated());
        assert_eq!(propagated.context(), &parent);

        let minted = sampler.resolve_inbound(None);
        assert!(!minted.is_propagated());
        assert!(!minted.context().is_sampled());
    }
}
