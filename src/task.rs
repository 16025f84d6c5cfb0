//! Task model: the unit of analysis work with routing-relevant attributes.
//!
//! A [`Task`] is an immutable value describing one analysis request. It is
//! created by the caller (builder-style), never mutated afterwards, and
//! consumed by the routing engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of an analysis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Numeric risk scoring of a transaction or entity.
    RiskScoring,
    /// Fraud-indicator detection.
    FraudDetection,
    /// Regulatory/compliance verification.
    ComplianceCheck,
    /// Single- or multi-document analysis.
    DocumentAnalysis,
    /// Anything that does not fit a specific category.
    #[default]
    General,
}

/// A single analysis request.
///
/// Field invariants are enforced at construction: `business_impact` is
/// clamped to `[0, 1]` (both by the builder and on deserialization) and
/// `context_length` is non-negative by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (defaults to a v4 UUID).
    pub id: String,
    /// Task description or prompt text.
    pub description: String,
    /// Category of the task.
    pub task_type: TaskType,
    /// Whether the caller requires strictly structured JSON output.
    pub requires_strict_json: bool,
    /// Estimated token count of the task's context.
    pub context_length: u64,
    /// Whether the task spans multiple documents.
    pub multi_document: bool,
    /// Business criticality in `[0, 1]` (0 = low, 1 = critical).
    #[serde(deserialize_with = "deserialize_business_impact")]
    pub business_impact: f64,
}

/// Clamp a wire-received impact to `[0, 1]`, matching the builder, so a
/// deserialized task carries the same invariant as a constructed one.
fn deserialize_business_impact<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let impact = f64::deserialize(deserializer)?;
    Ok(impact.clamp(0.0, 1.0))
}

impl Task {
    /// Create a task with the given description and default attributes
    /// (`General` type, no strict JSON, zero context, impact 0.5).
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            task_type: TaskType::General,
            requires_strict_json: false,
            context_length: 0,
            multi_document: false,
            business_impact: 0.5,
        }
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the task category.
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Require strictly structured JSON output.
    pub fn with_strict_json(mut self, requires: bool) -> Self {
        self.requires_strict_json = requires;
        self
    }

    /// Set the estimated context token count.
    pub fn with_context_length(mut self, tokens: u64) -> Self {
        self.context_length = tokens;
        self
    }

    /// Mark the task as multi-document analysis.
    pub fn with_multi_document(mut self, multi: bool) -> Self {
        self.multi_document = multi;
        self
    }

    /// Set the business impact, clamped to `[0, 1]`.
    pub fn with_business_impact(mut self, impact: f64) -> Self {
        self.business_impact = impact.clamp(0.0, 1.0);
        self
    }
}
