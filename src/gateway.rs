//! Gateway façade: routing, governance, ensemble, and audit behind one
//! entry point.
//!
//! [`Gateway::handle`] is the full path for one task: route it, run the
//! governed call (or parallel ensemble), and return the outcome with the
//! routing decision attached. Every step lands in the audit chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::audit::{AuditChain, AuditEvent, AuditEventType, AuditHandle, IntegrityReport};
use crate::config::GatewayConfig;
use crate::ensemble::{EnsembleArbiter, EnsembleDecision};
use crate::governor::budget::BudgetStatus;
use crate::governor::cache::CacheStats;
use crate::governor::rate_limit::RateUsage;
use crate::governor::ResourceGovernor;
use crate::metrics;
use crate::provider::{ProviderRequest, ProviderResult, ProviderSet};
use crate::router::{RouteTarget, RoutingDecision, RoutingEngine};
use crate::task::Task;
use crate::GatewayError;

/// What the selected dispatch path produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResponse {
    /// One provider served the task.
    Single(ProviderResult),
    /// Both providers evaluated the task and were reconciled.
    Ensemble(EnsembleDecision),
}

/// The complete outcome of handling one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Id of the handled task.
    pub task_id: String,
    /// The routing decision that selected the dispatch path.
    pub routing: RoutingDecision,
    /// The result of the dispatch.
    pub response: TaskResponse,
}

/// Top-level orchestration gateway.
///
/// Construct once at startup from a validated [`GatewayConfig`] and share
/// via `Arc`; all methods take `&self` and are safe to call concurrently.
pub struct Gateway {
    router: RoutingEngine,
    governor: ResourceGovernor,
    arbiter: EnsembleArbiter,
    providers: ProviderSet,
    audit: AuditHandle,
}

impl Gateway {
    /// Build a gateway with an in-memory audit chain.
    pub fn new(config: &GatewayConfig, providers: ProviderSet) -> Self {
        Self::with_audit(config, providers, AuditChain::spawn_memory())
    }

    /// Build a gateway around an existing audit chain (e.g. a JSONL-backed
    /// one from [`AuditChain::spawn_jsonl`]).
    pub fn with_audit(
        config: &GatewayConfig,
        providers: ProviderSet,
        audit: AuditHandle,
    ) -> Self {
        Self {
            router: RoutingEngine::new(&config.routing),
            governor: ResourceGovernor::new(config, audit.clone()),
            arbiter: EnsembleArbiter::new(&config.ensemble),
            providers,
            audit,
        }
    }

    /// Handle one task end to end: route, govern, dispatch, reconcile.
    ///
    /// # Errors
    ///
    /// Governance rejections ([`GatewayError::RateLimited`],
    /// [`GatewayError::BudgetExceeded`]), ensemble failures, and audit
    /// storage failures propagate to the caller.
    #[instrument(skip_all, fields(identity, task_id = %task.id))]
    pub async fn handle(&self, identity: &str, task: &Task) -> Result<TaskOutcome, GatewayError> {
        let routing = self.router.decide(task);
        info!(
            target = %routing.target,
            rule = routing.matched_rule,
            reason = %routing.reason,
            "task routed"
        );
        metrics::record_routing_decision(&routing.target.to_string());
        self.audit
            .append(
                AuditEventType::RoutingDecision,
                json!({
                    "identity": identity,
                    "task_id": task.id,
                    "target": routing.target.to_string(),
                    "matched_rule": routing.matched_rule,
                    "reason": routing.reason,
                }),
            )
            .await?;

        let response = match routing.target {
            RouteTarget::Single(provider_id) => {
                let request = ProviderRequest::from_task(task);
                let result = self
                    .governor
                    .call(identity, self.providers.get(provider_id).as_ref(), &request)
                    .await?;
                TaskResponse::Single(result)
            }
            RouteTarget::Ensemble => {
                let decision = self
                    .arbiter
                    .evaluate(identity, task, &self.providers, &self.governor)
                    .await?;
                TaskResponse::Ensemble(decision)
            }
        };

        Ok(TaskOutcome {
            task_id: task.id.clone(),
            routing,
            response,
        })
    }

    /// Route a task without dispatching it. Useful for dry runs and cost
    /// estimation.
    pub fn decide(&self, task: &Task) -> RoutingDecision {
        self.router.decide(task)
    }

    /// Spend position for an identity.
    pub fn budget_status(&self, identity: &str) -> BudgetStatus {
        self.governor.budget_status(identity)
    }

    /// Remaining rate capacity for an identity.
    pub fn rate_usage(&self, identity: &str) -> RateUsage {
        self.governor.rate_usage(identity)
    }

    /// Cache hit/miss counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.governor.cache_stats()
    }

    /// Verify the integrity of the audit chain.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuditChannelClosed`] if the audit appender
    /// task is gone.
    pub async fn verify_audit(&self) -> Result<IntegrityReport, GatewayError> {
        self.audit.verify().await
    }

    /// Export audit events in a time range for compliance reporting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuditChannelClosed`] if the audit appender
    /// task is gone.
    pub async fn export_audit(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, GatewayError> {
        self.audit.export(start, end).await
    }

    /// Handle to the underlying audit chain.
    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }
}

/// Convenience alias for sharing a gateway across tasks.
pub type SharedGateway = Arc<Gateway>;

// ── Tests ──────────────────────────────────────────────────────────────
