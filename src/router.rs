//! Routing engine: deterministic task-to-provider selection.
//!
//! [`RoutingEngine::decide`] is a pure function over a [`Task`]: no side
//! effects, no clock, no I/O, identical input always yields the identical
//! decision. Rules are evaluated in a fixed order and the first match wins;
//! the ordering is a deliberate design choice (structured-output needs beat
//! context size, which beats impact-driven ensembling).
//!
//! Both thresholds use strict inequalities: a value exactly equal to a
//! threshold does not trigger that rule and falls through to the next.

use serde::Serialize;

use crate::config::RoutingConfig;
use crate::provider::ProviderId;
use crate::task::Task;

/// Where a task should be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// One specific provider serves the task alone.
    Single(ProviderId),
    /// Both providers evaluate the task in parallel with reconciliation.
    Ensemble,
}

impl RouteTarget {
    /// Return the single provider, if any.
    pub fn provider(self) -> Option<ProviderId> {
        match self {
            Self::Single(p) => Some(p),
            Self::Ensemble => None,
        }
    }

    /// Return `true` for the ensemble target.
    pub fn is_ensemble(self) -> bool {
        matches!(self, Self::Ensemble)
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(p) => f.write_str(p.as_str()),
            Self::Ensemble => f.write_str("ensemble"),
        }
    }
}

/// The routing decision for a single task.
///
/// Carries the ordinal of the matched rule and a templated explanation so
/// every decision is observable; the gateway logs and audits both, never
/// silently drops them.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Selected dispatch target.
    pub target: RouteTarget,
    /// Human-readable explanation of why this target was selected.
    pub reason: String,
    /// Ordinal (1–5) of the rule that matched.
    pub matched_rule: u8,
}

/// Deterministic routing engine.
///
/// Thresholds are captured at construction from the immutable startup
/// configuration.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    context_threshold: u64,
    impact_threshold: f64,
}

impl RoutingEngine {
    /// Create an engine with the given thresholds.
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            context_threshold: config.context_threshold,
            impact_threshold: config.impact_threshold,
        }
    }

    /// Decide the dispatch target for a task.
    ///
    /// Rule order (first match wins):
    /// 1. strict JSON required → OpenAI
    /// 2. context length strictly above threshold → Gemini
    /// 3. multi-document analysis → Gemini
    /// 4. business impact strictly above threshold → ensemble
    /// 5. default → OpenAI
    pub fn decide(&self, task: &Task) -> RoutingDecision {
        if task.requires_strict_json {
            return RoutingDecision {
                target: RouteTarget::Single(ProviderId::OpenAi),
                reason: "Structured JSON output required - OpenAI provides best schema adherence"
                    .to_string(),
                matched_rule: 1,
            };
        }

        if task.context_length > self.context_threshold {
            return RoutingDecision {
                target: RouteTarget::Single(ProviderId::Gemini),
                reason: format!(
                    "Large context ({} tokens) - Gemini optimized for long-context processing",
                    task.context_length
                ),
                matched_rule: 2,
            };
        }

        if task.multi_document {
            return RoutingDecision {
                target: RouteTarget::Single(ProviderId::Gemini),
                reason: "Multi-document analysis - Gemini excels at cross-document correlation"
                    .to_string(),
                matched_rule: 3,
            };
        }

        if task.business_impact > self.impact_threshold {
            return RoutingDecision {
                target: RouteTarget::Ensemble,
                reason: format!(
                    "High business impact ({:.0}%) - ensemble validation for critical decisions",
                    task.business_impact * 100.0
                ),
                matched_rule: 4,
            };
        }

        RoutingDecision {
            target: RouteTarget::Single(ProviderId::OpenAi),
            reason: "General task - OpenAI provides optimal balance of speed, cost, and quality"
                .to_string(),
            matched_rule: 5,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
