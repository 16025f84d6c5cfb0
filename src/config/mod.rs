//! # Gateway configuration
//!
//! ## Responsibility
//! Define the configuration schema for the gateway: routing thresholds,
//! ensemble reconciliation parameters, rate limits, budget limits, cache
//! TTL, and privileged identities. Parse it from TOML and validate all
//! semantic constraints before a config is accepted.
//!
//! ## Guarantees
//! - Deterministic: the same TOML input always produces the same config
//! - Validated: semantic constraints are checked before a config is used
//! - Immutable: loaded once at startup and passed by reference into each
//!   component constructor, no ambient/global lookup
//!
//! ## NOT Responsible For
//! - Hot-reloading (out of scope for the process lifetime)
//! - Building components from config (that belongs to `gateway`)

pub mod loader;
pub mod validation;

pub use loader::{load_from_file, load_from_str};
pub use validation::ConfigError;

use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default long-context routing threshold: 80 000 tokens.
fn default_context_threshold() -> u64 {
    80_000
}

/// Default business-impact threshold for ensemble routing.
fn default_impact_threshold() -> f64 {
    0.8
}

/// Default ensemble score-deviation threshold (0–100 scale).
fn default_deviation_threshold() -> f64 {
    15.0
}

/// Default consensus band: deltas at or below this are full consensus.
fn default_consensus_band() -> f64 {
    5.0
}

/// Default confidence multiplier applied when one ensemble leg fails.
fn default_partial_confidence_penalty() -> f64 {
    0.5
}

/// Default per-minute request limit.
fn default_per_minute() -> u32 {
    60
}

/// Default per-hour request limit.
fn default_per_hour() -> u32 {
    1000
}

/// Default daily budget limit in USD.
fn default_daily_limit() -> f64 {
    100.0
}

/// Default monthly budget limit in USD.
fn default_monthly_limit() -> f64 {
    1000.0
}

/// Default cache TTL: one hour.
fn default_cache_ttl_secs() -> u64 {
    3600
}

/// Default maximum cache entries.
fn default_cache_max_entries() -> usize {
    10_000
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root gateway configuration.
///
/// Deserialized from TOML and validated before use. Every field has a
/// documented default, so an empty TOML document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Routing engine thresholds.
    pub routing: RoutingConfig,
    /// Ensemble reconciliation parameters.
    pub ensemble: EnsembleConfig,
    /// Per-identity rate limits.
    pub rate: RateConfig,
    /// Per-identity budget limits.
    pub budget: BudgetConfig,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Identities that bypass rate and budget enforcement (never audit
    /// logging or caching).
    pub bypass_identities: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            ensemble: EnsembleConfig::default(),
            rate: RateConfig::default(),
            budget: BudgetConfig::default(),
            cache: CacheConfig::default(),
            bypass_identities: Vec::new(),
        }
    }
}

/// Routing engine thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Context lengths strictly above this route to the long-context
    /// specialist.
    #[serde(default = "default_context_threshold")]
    pub context_threshold: u64,
    /// Business impact strictly above this routes to the ensemble.
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            context_threshold: default_context_threshold(),
            impact_threshold: default_impact_threshold(),
        }
    }
}

/// Ensemble reconciliation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Score deltas strictly above this escalate to human review.
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: f64,
    /// Score deltas at or below this are full consensus.
    #[serde(default = "default_consensus_band")]
    pub consensus_band: f64,
    /// Confidence multiplier applied to the surviving result when exactly
    /// one provider call fails.
    #[serde(default = "default_partial_confidence_penalty")]
    pub partial_confidence_penalty: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: default_deviation_threshold(),
            consensus_band: default_consensus_band(),
            partial_confidence_penalty: default_partial_confidence_penalty(),
        }
    }
}

/// Per-identity rate limits. Both windows are enforced independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Requests allowed per minute.
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    /// Requests allowed per hour.
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
        }
    }
}

/// Per-identity budget limits in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Daily spend limit.
    #[serde(default = "default_daily_limit")]
    pub daily_limit_usd: f64,
    /// Monthly spend limit.
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: default_daily_limit(),
            monthly_limit_usd: default_monthly_limit(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live for cached results, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of cached entries before eviction.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}
