//! Prometheus metrics for gateway operations.
//!
//! All metrics live in a lazily-initialised global bundle; recording
//! helpers are no-ops if registration failed, so metrics can never take
//! down the request path.

use std::sync::OnceLock;

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

use crate::provider::ProviderId;

/// Global metrics bundle.
struct Metrics {
    registry: Registry,
    provider_calls: IntCounterVec,
    provider_latency: HistogramVec,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    rejections: IntCounterVec,
    routing_decisions: IntCounterVec,
    ensemble_outcomes: IntCounterVec,
    spend_usd: CounterVec,
}

fn metrics() -> Option<&'static Metrics> {
    static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();
    METRICS.get_or_init(build_metrics).as_ref()
}

fn build_metrics() -> Option<Metrics> {
    let registry = Registry::new();

    let provider_calls = IntCounterVec::new(
        Opts::new("modelgate_provider_calls_total", "Provider calls by outcome"),
        &["provider", "outcome"],
    )
    .ok()?;
    let provider_latency = HistogramVec::new(
        HistogramOpts::new(
            "modelgate_provider_latency_seconds",
            "Provider call latency",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["provider"],
    )
    .ok()?;
    let cache_hits = IntCounter::new("modelgate_cache_hits_total", "Cache hits").ok()?;
    let cache_misses = IntCounter::new("modelgate_cache_misses_total", "Cache misses").ok()?;
    let rejections = IntCounterVec::new(
        Opts::new(
            "modelgate_rejections_total",
            "Calls rejected by governance controls",
        ),
        &["control"],
    )
    .ok()?;
    let routing_decisions = IntCounterVec::new(
        Opts::new(
            "modelgate_routing_decisions_total",
            "Routing decisions by target",
        ),
        &["target"],
    )
    .ok()?;
    let ensemble_outcomes = IntCounterVec::new(
        Opts::new(
            "modelgate_ensemble_outcomes_total",
            "Ensemble reconciliation outcomes",
        ),
        &["outcome"],
    )
    .ok()?;
    let spend_usd = CounterVec::new(
        Opts::new("modelgate_spend_usd_total", "Recorded provider spend in USD"),
        &["provider"],
    )
    .ok()?;

    registry.register(Box::new(provider_calls.clone())).ok()?;
    registry.register(Box::new(provider_latency.clone())).ok()?;
    registry.register(Box::new(cache_hits.clone())).ok()?;
    registry.register(Box::new(cache_misses.clone())).ok()?;
    registry.register(Box::new(rejections.clone())).ok()?;
    registry.register(Box::new(routing_decisions.clone())).ok()?;
    registry.register(Box::new(ensemble_outcomes.clone())).ok()?;
    registry.register(Box::new(spend_usd.clone())).ok()?;

    Some(Metrics {
        registry,
        provider_calls,
        provider_latency,
        cache_hits,
        cache_misses,
        rejections,
        routing_decisions,
        ensemble_outcomes,
        spend_usd,
    })
}

/// Record one provider call and its latency.
pub fn record_provider_call(provider: ProviderId, success: bool, latency_ms: u64) {
    if let Some(m) = metrics() {
        let outcome = if success { "success" } else { "failure" };
        m.provider_calls
            .with_label_values(&[provider.as_str(), outcome])
            .inc();
        m.provider_latency
            .with_label_values(&[provider.as_str()])
            .observe(latency_ms as f64 / 1000.0);
    }
}

/// Record a cache hit.
pub fn record_cache_hit() {
    if let Some(m) = metrics() {
        m.cache_hits.inc();
    }
}

/// Record a cache miss.
pub fn record_cache_miss() {
    if let Some(m) = metrics() {
        m.cache_misses.inc();
    }
}

/// Record a governance rejection (`"rate"` or `"budget"`).
pub fn record_rejection(control: &str) {
    if let Some(m) = metrics() {
        m.rejections.with_label_values(&[control]).inc();
    }
}

/// Record a routing decision by target name.
pub fn record_routing_decision(target: &str) {
    if let Some(m) = metrics() {
        m.routing_decisions.with_label_values(&[target]).inc();
    }
}

/// Record an ensemble outcome by name.
pub fn record_ensemble_outcome(outcome: &str) {
    if let Some(m) = metrics() {
        m.ensemble_outcomes.with_label_values(&[outcome]).inc();
    }
}

/// Record provider spend in USD.
pub fn record_spend(provider: ProviderId, cost_usd: f64) {
    if let Some(m) = metrics() {
        m.spend_usd
            .with_label_values(&[provider.as_str()])
            .inc_by(cost_usd);
    }
}

/// Gather all gateway metrics for exposition.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map(|m| m.registry.gather()).unwrap_or_default()
}
