//! End-to-end properties of the resource control stack: ordering of the
//! cache, rate, and budget gates, accounting rules, and identity isolation.

use modelgate::audit::AuditChain;
use modelgate::config::GatewayConfig;
use modelgate::governor::ResourceGovernor;
use modelgate::{GatewayError, ProviderId, ProviderRequest, StaticProvider};

fn governor_with(config: &GatewayConfig) -> ResourceGovernor {
    ResourceGovernor::new(config, AuditChain::spawn_memory())
}

fn scored_provider(cost: f64) -> StaticProvider {
    StaticProvider::new(ProviderId::OpenAi)
        .with_content(r#"{"risk_score": 25, "confidence": 0.7}"#)
        .with_cost(cost)
}

#[tokio::test]
async fn cache_hit_consumes_no_rate_tokens_and_no_budget() {
    let mut config = GatewayConfig::default();
    config.rate.per_minute = 1;
    let gov = governor_with(&config);
    let provider = scored_provider(0.01);
    let request = ProviderRequest::new("same exact prompt");

    // First call exhausts the per-minute window and populates the cache.
    gov.call("alice", &provider, &request).await.unwrap();
    let spent = gov.budget_status("alice").daily.spent;

    // Repeats are served from cache, untouched by the empty rate bucket.
    for _ in 0..5 {
        let result = gov.call("alice", &provider, &request).await.unwrap();
        assert!(result.success);
    }
    assert_eq!(gov.budget_status("alice").daily.spent, spent);
    assert_eq!(gov.cache_stats().hits, 5);
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_guidance() {
    let mut config = GatewayConfig::default();
    config.rate.per_minute = 2;
    let gov = governor_with(&config);
    let provider = scored_provider(0.001);

    gov.call("bob", &provider, &ProviderRequest::new("p1"))
        .await
        .unwrap();
    gov.call("bob", &provider, &ProviderRequest::new("p2"))
        .await
        .unwrap();

    let err = gov
        .call("bob", &provider, &ProviderRequest::new("p3"))
        .await
        .unwrap_err();
    match err {
        GatewayError::RateLimited {
            identity,
            limit,
            retry_after_secs,
            ..
        } => {
            assert_eq!(identity, "bob");
            assert_eq!(limit, 2);
            // 2/minute refills a token within 30 seconds.
            assert!(retry_after_secs <= 30);
        }
        other => panic!("expected RateLimited, got {other}"),
    }
}

#[tokio::test]
async fn budget_exhaustion_blocks_until_reset() {
    let mut config = GatewayConfig::default();
    config.budget.daily_limit_usd = 0.02;
    config.budget.monthly_limit_usd = 1.0;
    let gov = governor_with(&config);
    let provider = scored_provider(0.02);

    // Admitted: spend-to-date (0) is strictly below the limit.
    gov.call("carol", &provider, &ProviderRequest::new("p1"))
        .await
        .unwrap();

    // Spend now equals the limit, so the next call is rejected.
    let err = gov
        .call("carol", &provider, &ProviderRequest::new("p2"))
        .await
        .unwrap_err();
    match err {
        GatewayError::BudgetExceeded { spent, limit, .. } => {
            assert!((spent - 0.02).abs() < 1e-9);
            assert!((limit - 0.02).abs() < 1e-9);
        }
        other => panic!("expected BudgetExceeded, got {other}"),
    }
}

#[tokio::test]
async fn failed_provider_calls_cost_nothing_and_cache_nothing() {
    let config = GatewayConfig::default();
    let gov = governor_with(&config);
    let provider = StaticProvider::new(ProviderId::OpenAi).failing("connection reset");
    let request = ProviderRequest::new("p");

    for _ in 0..3 {
        let result = gov.call("dave", &provider, &request).await.unwrap();
        assert!(!result.success);
    }
    assert_eq!(gov.budget_status("dave").daily.spent, 0.0);
    assert_eq!(gov.cache_stats().hits, 0);
}

#[tokio::test]
async fn identities_do_not_share_limits() {
    let mut config = GatewayConfig::default();
    config.rate.per_minute = 1;
    let gov = governor_with(&config);
    let provider = scored_provider(0.001);

    gov.call("tenant-a", &provider, &ProviderRequest::new("p"))
        .await
        .unwrap();
    assert!(gov
        .call("tenant-a", &provider, &ProviderRequest::new("q"))
        .await
        .is_err());

    // tenant-b has its own full bucket.
    assert!(gov
        .call("tenant-b", &provider, &ProviderRequest::new("q"))
        .await
        .is_ok());
}

#[tokio::test]
async fn bypass_identity_is_unthrottled_but_fully_accounted() {
    let mut config = GatewayConfig::default();
    config.rate.per_minute = 1;
    config.budget.daily_limit_usd = 0.001;
    config.budget.monthly_limit_usd = 0.001;
    config.bypass_identities = vec!["system".to_string()];
    let gov = governor_with(&config);
    let provider = scored_provider(0.01);

    // Far beyond both the rate and the budget limits.
    for i in 0..5 {
        gov.call("system", &provider, &ProviderRequest::new(format!("p{i}")))
            .await
            .unwrap();
    }
    let status = gov.budget_status("system");
    assert!((status.daily.spent - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn rate_usage_and_cache_stats_observable() {
    let mut config = GatewayConfig::default();
    config.rate.per_minute = 10;
    let gov = governor_with(&config);
    let provider = scored_provider(0.001);

    gov.call("erin", &provider, &ProviderRequest::new("p"))
        .await
        .unwrap();

    let usage = gov.rate_usage("erin");
    assert_eq!(usage.minute_limit, 10);
    assert!(usage.minute_remaining < 10);

    let stats = gov.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
}
