//! Sampling Tests
//!
//! Parent-based decisions and the ratio applied to new traces.

use trace_relay::telemetry::propagation::{SpanId, TraceContext, TraceId};
use trace_relay::telemetry::sampling::should_sample;
use trace_relay::telemetry::{Sampler, SamplingDecision};

fn trace_id_with_low(low: u64) -> TraceId {
    let mut bytes = [0u8; 16];
    bytes[0] = 1;
    bytes[8..].copy_from_slice(&low.to_be_bytes());
    TraceId::from_bytes(bytes).unwrap()
}

#[test]
fn test_sampled_parent_is_honoured_at_ratio_zero() {
    let parent = TraceContext::new(TraceId::random(), SpanId::random(), true);
    assert!(should_sample(Some(&parent), TraceId::random(), 0.0));
}

#[test]
fn test_unsampled_parent_is_honoured_at_ratio_one() {
    let parent = TraceContext::new(TraceId::random(), SpanId::random(), false);
    assert!(!should_sample(Some(&parent), TraceId::random(), 1.0));
}

#[test]
fn test_ratio_bounds() {
    for _ in 0..100 {
        assert!(should_sample(None, TraceId::random(), 1.0));
        assert!(!should_sample(None, TraceId::random(), 0.0));
    }
}

#[test]
fn test_ratio_decision_uses_low_bits() {
    assert!(should_sample(None, trace_id_with_low(0), 0.5));
    assert!(should_sample(None, trace_id_with_low(u64::MAX / 4), 0.5));
    assert!(!should_sample(None, trace_id_with_low(u64::MAX / 4 * 3), 0.5));
    assert!(!should_sample(None, trace_id_with_low(u64::MAX), 0.5));
}

#[test]
fn test_decision_is_deterministic() {
    let sampler = Sampler::new(0.3);
    let id = TraceId::random();
    let first = sampler.decide(None, id);
    for _ in 0..10 {
        assert_eq!(sampler.decide(None, id), first);
    }
}

#[test]
fn test_ratio_is_roughly_applied() {
    let sampler = Sampler::new(0.25);
    let sampled = (0..4000)
        .filter(|_| sampler.new_root().is_sampled())
        .count();

    // 1000 expected; wide bounds keep this stable
    assert!((700..1300).contains(&sampled), "sampled {}", sampled);
}

#[test]
fn test_sampler_clamps_ratio() {
    assert_eq!(Sampler::new(3.0).ratio(), 1.0);
    assert_eq!(Sampler::new(-1.0).ratio(), 0.0);
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
    assert_eq!(
        sampler.decide(None, minted.context().trace_id()),
        SamplingDecision::Drop
    );
}
