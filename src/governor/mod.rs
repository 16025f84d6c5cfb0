//! Resource governor: the mandatory gate in front of every provider call.
//!
//! Controls compose in a fixed order: cache lookup, then rate limiting,
//! then budget enforcement, and only then the provider call. The ordering
//! is load-bearing: a cache hit consumes neither rate tokens nor budget,
//! and a rate rejection is reported before a budget rejection when both
//! would fire.
//!
//! Every path through the governor appends audit events; an audit append
//! failure fails the call itself.

pub mod budget;
pub mod cache;
pub mod rate_limit;

use std::collections::HashSet;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::audit::{AuditEventType, AuditHandle};
use crate::config::GatewayConfig;
use crate::metrics;
use crate::provider::{ProviderAdapter, ProviderRequest, ProviderResult};
use crate::GatewayError;

use budget::{BudgetStatus, BudgetTracker, BudgetVerdict};
use cache::{CacheStats, ResponseCache};
use rate_limit::{RateLimiter, RateUsage, RateVerdict};

/// Composes cache, rate limiter, and budget tracker around provider calls.
///
/// Privileged identities (from `bypass_identities`) skip rate and budget
/// *enforcement* but never caching, spend recording, or audit logging:
/// their activity must remain fully accounted and attributable.
pub struct ResourceGovernor {
    cache: ResponseCache,
    rate: RateLimiter,
    budget: BudgetTracker,
    bypass: HashSet<String>,
    audit: AuditHandle,
}

impl ResourceGovernor {
    /// Build a governor from configuration, wiring in the audit handle.
    pub fn new(config: &GatewayConfig, audit: AuditHandle) -> Self {
        Self {
            cache: ResponseCache::new(&config.cache),
            rate: RateLimiter::new(&config.rate),
            budget: BudgetTracker::new(&config.budget),
            bypass: config.bypass_identities.iter().cloned().collect(),
            audit,
        }
    }

    /// Run one provider call through the full control stack.
    ///
    /// Order: cache lookup → rate check → budget check → provider call →
    /// spend recording → cache store. Failed provider calls are neither
    /// cached nor charged to the budget.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::RateLimited`] when a rate window is exhausted.
    /// - [`GatewayError::BudgetExceeded`] when a budget period is exhausted.
    /// - [`GatewayError::AuditStorage`] / [`GatewayError::AuditChannelClosed`]
    ///   when the triggering audit event could not be recorded.
    #[instrument(skip_all, fields(identity, provider = %provider.id()))]
    pub async fn call(
        &self,
        identity: &str,
        provider: &dyn ProviderAdapter,
        request: &ProviderRequest,
    ) -> Result<ProviderResult, GatewayError> {
        let provider_id = provider.id();
        let key = cache::fingerprint(provider_id, request);

        // 1. Cache. A hit bypasses every other control.
        if let Some(key) = &key {
            if let Some(cached) = self.cache.get(key) {
                info!(identity, provider = %provider_id, "served from cache");
                metrics::record_cache_hit();
                self.audit
                    .append(
                        AuditEventType::CacheHit,
                        json!({
                            "identity": identity,
                            "provider": provider_id.as_str(),
                            "fingerprint": key,
                        }),
                    )
                    .await?;
                return Ok(cached);
            }
            metrics::record_cache_miss();
            self.audit
                .append(
                    AuditEventType::CacheMiss,
                    json!({
                        "identity": identity,
                        "provider": provider_id.as_str(),
                        "fingerprint": key,
                    }),
                )
                .await?;
        }

        let privileged = self.bypass.contains(identity);

        // 2. Rate limit.
        if let RateVerdict::Limited {
            window,
            limit,
            retry_after_secs,
        } = self.rate.check(identity)
        {
            if privileged {
                warn!(identity, %window, "rate limit bypassed by privileged identity");
            } else {
                metrics::record_rejection("rate");
                self.audit
                    .append(
                        AuditEventType::RateLimitExceeded,
                        json!({
                            "identity": identity,
                            "window": window.to_string(),
                            "limit": limit,
                            "retry_after_secs": retry_after_secs,
                        }),
                    )
                    .await?;
                return Err(GatewayError::RateLimited {
                    identity: identity.to_string(),
                    window,
                    limit,
                    retry_after_secs,
                });
            }
        }

        // 3. Budget.
        if let BudgetVerdict::Exceeded {
            period,
            spent,
            limit,
        } = self.budget.check(identity)
        {
            if privileged {
                warn!(identity, %period, "budget limit bypassed by privileged identity");
            } else {
                metrics::record_rejection("budget");
                self.audit
                    .append(
                        AuditEventType::BudgetAlert,
                        json!({
                            "identity": identity,
                            "period": period.to_string(),
                            "spent": spent,
                            "limit": limit,
                        }),
                    )
                    .await?;
                return Err(GatewayError::BudgetExceeded {
                    identity: identity.to_string(),
                    period,
                    spent,
                    limit,
                });
            }
        }

        // 4. Provider call.
        self.audit
            .append(
                AuditEventType::RequestIssued,
                json!({
                    "identity": identity,
                    "provider": provider_id.as_str(),
                    "strict_json": request.strict_json,
                }),
            )
            .await?;

        let result = provider.invoke(request).await;
        metrics::record_provider_call(provider_id, result.success, result.latency_ms);

        self.audit
            .append(
                AuditEventType::ResponseReceived,
                json!({
                    "identity": identity,
                    "provider": provider_id.as_str(),
                    "success": result.success,
                    "cost_usd": result.cost,
                    "latency_ms": result.latency_ms,
                    "error": result.error,
                }),
            )
            .await?;

        // 5. Account and cache only completed calls. Privileged spend is
        // recorded too: bypass waives enforcement, not accounting.
        if result.success {
            self.budget.record(identity, result.cost);
            metrics::record_spend(provider_id, result.cost);
            if let Some(key) = key {
                self.cache.put(key, result.clone());
            }
        }

        Ok(result)
    }

    /// Spend position for an identity.
    pub fn budget_status(&self, identity: &str) -> BudgetStatus {
        self.budget.status(identity)
    }

    /// Remaining rate capacity for an identity.
    pub fn rate_usage(&self, identity: &str) -> RateUsage {
        self.rate.usage(identity)
    }

    /// Cache hit/miss counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Handle to the audit chain this governor appends to.
    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditChain;
    use crate::provider::{ProviderId, StaticProvider};

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    fn governor(config: &GatewayConfig) -> ResourceGovernor {
        ResourceGovernor::new(config, AuditChain::spawn_memory())
    }

    fn openai_static(content: &str) -> StaticProvider {
        StaticProvider::new(ProviderId::OpenAi).with_content(content)
    }

    // -- control ordering ------------------------------------------------

    #[tokio::test]
    async fn test_successful_call_passes_all_controls() {
        let config = config();
        let gov = governor(&config);
        let provider = openai_static(r#"{"risk_score": 20}"#);
        let request = ProviderRequest::new("score this");

        let result = gov.call("alice", &provider, &request).await.unwrap();
        assert!(result.success);
        assert!(gov.budget_status("alice").daily.spent > 0.0);
    }

    #[tokio::test]
    async fn test_cache_hit_consumes_no_rate_or_budget() {
        let mut config = config();
        config.rate.per_minute = 1;
        let gov = governor(&config);
        let provider = openai_static("answer").with_cost(0.01);
        let request = ProviderRequest::new("identical prompt");

        // First call consumes the only minute token and fills the cache.
        gov.call("alice", &provider, &request).await.unwrap();
        let spent_after_first = gov.budget_status("alice").daily.spent;

        // Second identical call must be served from cache despite the
        // empty rate bucket, and must not add spend.
        let cached = gov.call("alice", &provider, &request).await.unwrap();
        assert_eq!(cached.content, "answer");
        let spent_after_second = gov.budget_status("alice").daily.spent;
        assert_eq!(spent_after_first, spent_after_second);
        assert_eq!(gov.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_rate_rejection_precedes_budget_rejection() {
        let mut config = config();
        config.rate.per_minute = 1;
        config.budget.daily_limit_usd = 0.001;
        config.budget.monthly_limit_usd = 0.001;
        let gov = governor(&config);
        let provider = openai_static("a").with_cost(0.01);

        // Consume the single rate token (spend now exceeds the budget too).
        gov.call("alice", &provider, &ProviderRequest::new("p1"))
            .await
            .unwrap();

        // Both controls would reject; rate must be reported.
        let err = gov
            .call("alice", &provider, &ProviderRequest::new("p2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_budget_rejection_when_rate_allows() {
        let mut config = config();
        config.budget.daily_limit_usd = 0.005;
        config.budget.monthly_limit_usd = 0.005;
        let gov = governor(&config);
        let provider = openai_static("a").with_cost(0.01);

        gov.call("alice", &provider, &ProviderRequest::new("p1"))
            .await
            .unwrap();
        let err = gov
            .call("alice", &provider, &ProviderRequest::new("p2"))
            .await
            .unwrap_err();
        match err {
            GatewayError::BudgetExceeded { spent, .. } => assert!(spent >= 0.005),
            other => panic!("expected BudgetExceeded, got {other}"),
        }
    }

    // -- failure accounting ----------------------------------------------

    #[tokio::test]
    async fn test_failed_call_is_not_cached_or_charged() {
        let config = config();
        let gov = governor(&config);
        let provider = StaticProvider::new(ProviderId::OpenAi).failing("upstream 500");
        let request = ProviderRequest::new("p");

        let result = gov.call("alice", &provider, &request).await.unwrap();
        assert!(!result.success);
        assert_eq!(gov.budget_status("alice").daily.spent, 0.0);

        // A retry must go to the provider again, not the cache.
        gov.call("alice", &provider, &request).await.unwrap();
        assert_eq!(gov.cache_stats().hits, 0);
    }

    // -- bypass ----------------------------------------------------------

    #[tokio::test]
    async fn test_bypass_identity_skips_enforcement_but_records_spend() {
        let mut config = config();
        config.rate.per_minute = 1;
        config.bypass_identities = vec!["system".to_string()];
        let gov = governor(&config);
        let provider = openai_static("ok").with_cost(0.01);

        // Three distinct prompts against a one-token bucket.
        for i in 0..3 {
            gov.call("system", &provider, &ProviderRequest::new(format!("p{i}")))
                .await
                .unwrap();
        }
        // Spend is still accounted.
        let status = gov.budget_status("system");
        assert!((status.daily.spent - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bypass_does_not_extend_to_other_identities() {
        let mut config = config();
        config.rate.per_minute = 1;
        config.bypass_identities = vec!["system".to_string()];
        let gov = governor(&config);
        let provider = openai_static("ok");

        gov.call("mortal", &provider, &ProviderRequest::new("p1"))
            .await
            .unwrap();
        let err = gov
            .call("mortal", &provider, &ProviderRequest::new("p2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    // -- audit trail -----------------------------------------------------

    #[tokio::test]
    async fn test_call_emits_audit_events_in_order() {
        let config = config();
        let audit = AuditChain::spawn_memory();
        let gov = ResourceGovernor::new(&config, audit.clone());
        let provider = openai_static("ok");

        gov.call("alice", &provider, &ProviderRequest::new("p"))
            .await
            .unwrap();

        let events = audit.export(None, None).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                AuditEventType::CacheMiss,
                AuditEventType::RequestIssued,
                AuditEventType::ResponseReceived,
            ]
        );
    }

    #[tokio::test]
    async fn test_rate_rejection_is_audited() {
        let mut config = config();
        config.rate.per_minute = 1;
        let audit = AuditChain::spawn_memory();
        let gov = ResourceGovernor::new(&config, audit.clone());
        let provider = openai_static("ok");

        gov.call("alice", &provider, &ProviderRequest::new("p1"))
            .await
            .unwrap();
        let _ = gov.call("alice", &provider, &ProviderRequest::new("p2")).await;

        let events = audit.export(None, None).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == AuditEventType::RateLimitExceeded));
    }
}
