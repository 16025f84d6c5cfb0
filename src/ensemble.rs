//! Dual-provider ensemble arbiter.
//!
//! High-stakes tasks are evaluated by both providers in parallel and the
//! two risk scores are reconciled by delta:
//!
//! - delta ≤ consensus band → consensus, higher-confidence score wins
//! - delta ≤ deviation threshold → confidence-weighted average
//! - delta > deviation threshold → escalate to human review, no final score
//!
//! Escalation is a successful outcome, not an error: the system refusing
//! to guess when its validators disagree is the point of the ensemble.
//!
//! Each leg runs through the resource governor, so ensemble calls are
//! rate-limited, budgeted, cached, and audited like any single call.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::AuditEventType;
use crate::config::EnsembleConfig;
use crate::governor::ResourceGovernor;
use crate::metrics;
use crate::provider::{ProviderId, ProviderRequest, ProviderResult, ProviderSet};
use crate::task::Task;
use crate::GatewayError;

/// How the two provider scores were reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleOutcome {
    /// Scores agreed within the consensus band.
    Consensus,
    /// Scores diverged moderately; confidence-weighted average applied.
    WeightedAverage,
    /// Scores diverged beyond the deviation threshold; human review needed.
    Escalate,
}

impl EnsembleOutcome {
    /// Stable lowercase name for logs and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consensus => "consensus",
            Self::WeightedAverage => "weighted_average",
            Self::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for EnsembleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider's parsed risk assessment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredResult {
    /// Which provider produced the score.
    pub provider: ProviderId,
    /// Risk score on a 0–100 scale.
    pub risk_score: f64,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
}

/// The reconciled ensemble decision.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleDecision {
    /// How the scores were reconciled.
    pub outcome: EnsembleOutcome,
    /// Final risk score. `None` exactly when `outcome` is
    /// [`EnsembleOutcome::Escalate`].
    pub final_score: Option<f64>,
    /// Confidence attached to the final score.
    pub confidence: f64,
    /// Absolute delta between the two scores (`None` when only one leg
    /// produced a score).
    pub delta: Option<f64>,
    /// Per-leg parsed scores, in the order (OpenAI, Gemini), where present.
    pub scores: Vec<ScoredResult>,
    /// Whether a human must review before action.
    pub requires_human_review: bool,
    /// Set when exactly one leg produced a usable score and the decision
    /// rests on the survivor alone, at reduced confidence.
    pub degraded: bool,
    /// Human-readable explanation of the reconciliation.
    pub reasoning: String,
    /// Combined cost of both legs, USD.
    pub total_cost: f64,
}

/// Shape providers are asked to answer with.
#[derive(Debug, Deserialize)]
struct ScorePayload {
    risk_score: Option<f64>,
    confidence: Option<f64>,
}

/// Parse a provider's content into a scored result.
///
/// Tolerant of partial payloads: a missing `risk_score` defaults to 50
/// (maximal uncertainty on the 0–100 scale), a missing `confidence` to 0.5.
/// Returns `None` only when the content is not JSON at all, or the call
/// itself failed.
pub fn parse_scored(result: &ProviderResult) -> Option<ScoredResult> {
    if !result.success {
        return None;
    }
    let payload: ScorePayload = serde_json::from_str(&result.content).ok()?;
    Some(ScoredResult {
        provider: result.provider,
        risk_score: payload.risk_score.unwrap_or(50.0).clamp(0.0, 100.0),
        confidence: payload.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
    })
}

/// Reconciles parallel dual-provider evaluations.
pub struct EnsembleArbiter {
    consensus_band: f64,
    deviation_threshold: f64,
    partial_confidence_penalty: f64,
}

impl EnsembleArbiter {
    /// Create an arbiter with the configured reconciliation thresholds.
    pub fn new(config: &EnsembleConfig) -> Self {
        Self {
            consensus_band: config.consensus_band,
            deviation_threshold: config.deviation_threshold,
            partial_confidence_penalty: config.partial_confidence_penalty,
        }
    }

    /// Evaluate a task on both providers in parallel and reconcile.
    ///
    /// Both legs go through the governor, so each is individually cached,
    /// rate-limited, budgeted, and audited. One `EnsembleEvaluation` audit
    /// event records the reconciliation itself.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::EnsembleTotalFailure`] when both legs fail.
    /// - [`GatewayError::EnsemblePartialFailure`] when one leg fails and
    ///   the survivor produced no parseable score.
    /// - Governance errors propagate from either leg.
    pub async fn evaluate(
        &self,
        identity: &str,
        task: &Task,
        providers: &ProviderSet,
        governor: &ResourceGovernor,
    ) -> Result<EnsembleDecision, GatewayError> {
        let request = ProviderRequest::from_task(task).with_strict_json(true);

        let (openai_result, gemini_result) = tokio::join!(
            governor.call(identity, providers.get(ProviderId::OpenAi).as_ref(), &request),
            governor.call(identity, providers.get(ProviderId::Gemini).as_ref(), &request),
        );
        let openai = openai_result?;
        let gemini = gemini_result?;

        let total_cost = openai.cost + gemini.cost;
        let decision = self.reconcile(&openai, &gemini, total_cost)?;

        metrics::record_ensemble_outcome(decision.outcome.as_str());
        governor
            .audit()
            .append(
                AuditEventType::EnsembleEvaluation,
                json!({
                    "identity": identity,
                    "task_id": task.id,
                    "outcome": decision.outcome.as_str(),
                    "final_score": decision.final_score,
                    "confidence": decision.confidence,
                    "delta": decision.delta,
                    "requires_human_review": decision.requires_human_review,
                    "degraded": decision.degraded,
                    "reasoning": decision.reasoning,
                    "total_cost_usd": decision.total_cost,
                }),
            )
            .await?;

        Ok(decision)
    }

    /// Reconcile two completed leg results into a decision.
    fn reconcile(
        &self,
        openai: &ProviderResult,
        gemini: &ProviderResult,
        total_cost: f64,
    ) -> Result<EnsembleDecision, GatewayError> {
        let openai_score = parse_scored(openai);
        let gemini_score = parse_scored(gemini);

        match (openai_score, gemini_score) {
            (Some(a), Some(b)) => Ok(self.reconcile_pair(a, b, total_cost)),
            (Some(survivor), None) | (None, Some(survivor)) => {
                let (failed_result, _) = if survivor.provider == ProviderId::OpenAi {
                    (gemini, openai)
                } else {
                    (openai, gemini)
                };
                if failed_result.success {
                    // The other leg completed but its content was not
                    // scoreable; treat it the same as a failed leg.
                    warn!(
                        provider = %failed_result.provider,
                        "ensemble leg returned unscoreable content"
                    );
                }
                Ok(self.degraded(survivor, total_cost))
            }
            (None, None) => {
                // Distinguish two dead legs from two unscoreable ones.
                if openai.success && gemini.success {
                    return Err(GatewayError::EnsembleTotalFailure {
                        openai: "unscoreable response".to_string(),
                        gemini: "unscoreable response".to_string(),
                    });
                }
                if openai.success || gemini.success {
                    let (survivor, failed) = if openai.success {
                        (openai, gemini)
                    } else {
                        (gemini, openai)
                    };
                    return Err(GatewayError::EnsemblePartialFailure {
                        survivor: survivor.provider,
                        failed: failed.provider,
                        error: failed
                            .error
                            .clone()
                            .unwrap_or_else(|| "provider call failed".to_string()),
                    });
                }
                Err(GatewayError::EnsembleTotalFailure {
                    openai: openai
                        .error
                        .clone()
                        .unwrap_or_else(|| "provider call failed".to_string()),
                    gemini: gemini
                        .error
                        .clone()
                        .unwrap_or_else(|| "provider call failed".to_string()),
                })
            }
        }
    }

    /// Delta-based reconciliation of two scored legs.
    fn reconcile_pair(&self, a: ScoredResult, b: ScoredResult, total_cost: f64) -> EnsembleDecision {
        let delta = (a.risk_score - b.risk_score).abs();

        if delta <= self.consensus_band {
            // Full agreement: the more confident leg's score stands.
            let winner = if a.confidence >= b.confidence { a } else { b };
            let confidence = a.confidence.max(b.confidence);
            info!(delta, score = winner.risk_score, "ensemble consensus");
            return EnsembleDecision {
                outcome: EnsembleOutcome::Consensus,
                final_score: Some(winner.risk_score),
                confidence,
                delta: Some(delta),
                scores: vec![a, b],
                requires_human_review: false,
                degraded: false,
                reasoning: format!(
                    "Providers agree within {delta:.1} points; adopting the \
                     higher-confidence assessment from {}",
                    winner.provider
                ),
                total_cost,
            };
        }

        if delta <= self.deviation_threshold {
            let weight_sum = a.confidence + b.confidence;
            // Equal weights when both legs report zero confidence.
            let final_score = if weight_sum > 0.0 {
                (a.risk_score * a.confidence + b.risk_score * b.confidence) / weight_sum
            } else {
                (a.risk_score + b.risk_score) / 2.0
            };
            let confidence = (a.confidence + b.confidence) / 2.0;
            info!(delta, final_score, "ensemble weighted average");
            return EnsembleDecision {
                outcome: EnsembleOutcome::WeightedAverage,
                final_score: Some(final_score),
                confidence,
                delta: Some(delta),
                scores: vec![a, b],
                requires_human_review: false,
                degraded: false,
                reasoning: format!(
                    "Providers diverge by {delta:.1} points; applied a \
                     confidence-weighted average"
                ),
                total_cost,
            };
        }

        warn!(
            delta,
            openai = a.risk_score,
            gemini = b.risk_score,
            "ensemble deviation beyond threshold, escalating"
        );
        EnsembleDecision {
            outcome: EnsembleOutcome::Escalate,
            final_score: None,
            confidence: a.confidence.min(b.confidence),
            delta: Some(delta),
            scores: vec![a, b],
            requires_human_review: true,
            degraded: false,
            reasoning: format!(
                "Providers diverge by {delta:.1} points, beyond the {:.1}-point \
                 deviation threshold; no automated score is safe to emit",
                self.deviation_threshold
            ),
            total_cost,
        }
    }

    /// One usable leg: carry its score with a confidence penalty. The
    /// outcome stays `Consensus` (there is nothing to disagree with); the
    /// `degraded` flag records that only one validator was heard.
    fn degraded(&self, survivor: ScoredResult, total_cost: f64) -> EnsembleDecision {
        EnsembleDecision {
            outcome: EnsembleOutcome::Consensus,
            final_score: Some(survivor.risk_score),
            confidence: survivor.confidence * self.partial_confidence_penalty,
            delta: None,
            scores: vec![survivor],
            requires_human_review: false,
            degraded: true,
            reasoning: format!(
                "Only {} produced a usable score; carrying it at reduced confidence",
                survivor.provider
            ),
            total_cost,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> EnsembleArbiter {
        EnsembleArbiter::new(&EnsembleConfig::default())
    }

    fn ok_result(provider: ProviderId, content: &str) -> ProviderResult {
        ProviderResult {
            provider,
            model: format!("{provider}-test"),
            success: true,
            content: content.to_string(),
            input_tokens: 10,
            output_tokens: 10,
            cost: 0.01,
            latency_ms: 100,
            error: None,
        }
    }

    fn scored(provider: ProviderId, score: f64, confidence: f64) -> ProviderResult {
        ok_result(
            provider,
            &format!(r#"{{"risk_score": {score}, "confidence": {confidence}}}"#),
        )
    }

    // -- parsing ---------------------------------------------------------

    #[test]
    fn test_parse_full_payload() {
        let result = scored(ProviderId::OpenAi, 72.0, 0.9);
        let parsed = parse_scored(&result).unwrap();
        assert_eq!(parsed.risk_score, 72.0);
        assert_eq!(parsed.confidence, 0.9);
    }

    #[test]
    fn test_parse_missing_fields_use_neutral_defaults() {
        let result = ok_result(ProviderId::Gemini, "{}");
        let parsed = parse_scored(&result).unwrap();
        assert_eq!(parsed.risk_score, 50.0);
        assert_eq!(parsed.confidence, 0.5);
    }

    #[test]
    fn test_parse_out_of_range_values_clamped() {
        let result = ok_result(
            ProviderId::OpenAi,
            r#"{"risk_score": 250, "confidence": 1.8}"#,
        );
        let parsed = parse_scored(&result).unwrap();
        assert_eq!(parsed.risk_score, 100.0);
        assert_eq!(parsed.confidence, 1.0);
    }

    #[test]
    fn test_parse_non_json_is_none() {
        let result = ok_result(ProviderId::OpenAi, "the risk seems moderate");
        assert!(parse_scored(&result).is_none());
    }

    #[test]
    fn test_parse_failed_call_is_none() {
        let result = ProviderResult::failure(ProviderId::Gemini, "m", "timeout");
        assert!(parse_scored(&result).is_none());
    }

    // -- reconciliation: consensus --------------------------------------

    #[test]
    fn test_delta_within_band_is_consensus() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 70.0, 0.9),
                &scored(ProviderId::Gemini, 73.0, 0.8),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::Consensus);
        // Higher-confidence leg wins.
        assert_eq!(decision.final_score, Some(70.0));
        assert_eq!(decision.confidence, 0.9);
        assert!(!decision.requires_human_review);
        assert!(!decision.degraded);
    }

    #[test]
    fn test_delta_exactly_at_band_is_consensus() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 70.0, 0.9),
                &scored(ProviderId::Gemini, 75.0, 0.8),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::Consensus);
        assert_eq!(decision.delta, Some(5.0));
    }

    // -- reconciliation: weighted average --------------------------------

    #[test]
    fn test_moderate_delta_is_weighted_average() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 60.0, 0.9),
                &scored(ProviderId::Gemini, 70.0, 0.3),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::WeightedAverage);
        // (60*0.9 + 70*0.3) / 1.2 = 62.5
        let score = decision.final_score.unwrap();
        assert!((score - 62.5).abs() < 1e-9);
        assert!((decision.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_delta_exactly_at_deviation_threshold_is_weighted() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 50.0, 0.5),
                &scored(ProviderId::Gemini, 65.0, 0.5),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::WeightedAverage);
        assert_eq!(decision.delta, Some(15.0));
    }

    #[test]
    fn test_zero_confidence_pair_falls_back_to_plain_mean() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 60.0, 0.0),
                &scored(ProviderId::Gemini, 70.0, 0.0),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.final_score, Some(65.0));
    }

    // -- reconciliation: escalation --------------------------------------

    #[test]
    fn test_large_delta_escalates_without_score() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 20.0, 0.9),
                &scored(ProviderId::Gemini, 85.0, 0.8),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::Escalate);
        assert_eq!(decision.final_score, None);
        assert!(decision.requires_human_review);
        assert_eq!(decision.delta, Some(65.0));
        assert!(decision.reasoning.contains("65.0 points"));
        // Escalation is not an error: both raw scores are preserved.
        assert_eq!(decision.scores.len(), 2);
    }

    #[test]
    fn test_delta_just_above_threshold_escalates() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 50.0, 0.5),
                &scored(ProviderId::Gemini, 65.1, 0.5),
                0.02,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::Escalate);
    }

    // -- degraded and failure paths --------------------------------------

    #[test]
    fn test_one_failed_leg_degrades_with_penalty() {
        let a = arbiter();
        let decision = a
            .reconcile(
                &scored(ProviderId::OpenAi, 40.0, 0.8),
                &ProviderResult::failure(ProviderId::Gemini, "m", "timeout"),
                0.01,
            )
            .unwrap();
        assert_eq!(decision.outcome, EnsembleOutcome::Consensus);
        assert!(decision.degraded);
        assert_eq!(decision.final_score, Some(40.0));
        assert!((decision.confidence - 0.4).abs() < 1e-9);
        assert_eq!(decision.delta, None);
        assert_eq!(decision.scores.len(), 1);
    }

    #[test]
    fn test_unscoreable_survivor_is_partial_failure() {
        let a = arbiter();
        let err = a
            .reconcile(
                &ok_result(ProviderId::OpenAi, "free-form prose"),
                &ProviderResult::failure(ProviderId::Gemini, "m", "timeout"),
                0.01,
            )
            .unwrap_err();
        match err {
            GatewayError::EnsemblePartialFailure {
                survivor, failed, ..
            } => {
                assert_eq!(survivor, ProviderId::OpenAi);
                assert_eq!(failed, ProviderId::Gemini);
            }
            other => panic!("expected partial failure, got {other}"),
        }
    }

    #[test]
    fn test_both_legs_failed_is_total_failure() {
        let a = arbiter();
        let err = a
            .reconcile(
                &ProviderResult::failure(ProviderId::OpenAi, "m", "500"),
                &ProviderResult::failure(ProviderId::Gemini, "m", "timeout"),
                0.0,
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::EnsembleTotalFailure { .. }));
    }

    #[test]
    fn test_both_legs_unscoreable_is_total_failure() {
        let a = arbiter();
        let err = a
            .reconcile(
                &ok_result(ProviderId::OpenAi, "prose"),
                &ok_result(ProviderId::Gemini, "more prose"),
                0.02,
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::EnsembleTotalFailure { .. }));
    }

    // -- end to end through the governor ---------------------------------

    #[tokio::test]
    async fn test_evaluate_runs_both_legs_and_audits() {
        use crate::audit::{AuditChain, AuditEventType};
        use crate::config::GatewayConfig;
        use crate::provider::StaticProvider;
        use std::sync::Arc;

        let config = GatewayConfig::default();
        let audit = AuditChain::spawn_memory();
        let governor = ResourceGovernor::new(&config, audit.clone());
        let providers = ProviderSet::new(
            Arc::new(
                StaticProvider::new(ProviderId::OpenAi)
                    .with_content(r#"{"risk_score": 70, "confidence": 0.9}"#),
            ),
            Arc::new(
                StaticProvider::new(ProviderId::Gemini)
                    .with_content(r#"{"risk_score": 72, "confidence": 0.8}"#),
            ),
        );
        let task = Task::new("wire transfer approval").with_business_impact(0.95);

        let arbiter = EnsembleArbiter::new(&config.ensemble);
        let decision = arbiter
            .evaluate("alice", &task, &providers, &governor)
            .await
            .unwrap();

        assert_eq!(decision.outcome, EnsembleOutcome::Consensus);
        assert!((decision.total_cost - 0.002).abs() < 1e-9);

        let events = audit.export(None, None).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == AuditEventType::EnsembleEvaluation));
        // Each leg was individually audited.
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == AuditEventType::RequestIssued)
                .count(),
            2
        );
    }
}
