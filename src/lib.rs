//! # modelgate
//!
//! Routing and governance gateway for multi-provider LLM analysis workloads.
//!
//! ## Architecture
//!
//! ```text
//! Task → RoutingEngine → ResourceGovernor (cache → rate → budget) → Provider(s)
//!                      ↘ EnsembleArbiter (parallel dual-provider validation)
//!        every decision and outcome → AuditChain (hash-linked, append-only)
//! ```
//!
//! The crate has four load-bearing pieces: a deterministic routing engine
//! ([`router`]), a dual-provider ensemble arbiter ([`ensemble`]), a resource
//! governor composing caching, rate limiting, and budget enforcement
//! ([`governor`]), and a tamper-evident audit chain ([`audit`]). The
//! [`gateway::Gateway`] ties them together behind one entry point.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod audit;
pub mod config;
pub mod ensemble;
pub mod gateway;
pub mod governor;
pub mod metrics;
pub mod provider;
pub mod router;
pub mod task;

// Re-exports for convenience
pub use audit::{AuditChain, AuditEvent, AuditEventType, AuditHandle, IntegrityReport};
pub use config::GatewayConfig;
pub use ensemble::{EnsembleArbiter, EnsembleDecision, EnsembleOutcome};
pub use gateway::{Gateway, TaskOutcome, TaskResponse};
pub use governor::budget::{BudgetPeriod, BudgetStatus};
pub use governor::rate_limit::RateWindow;
pub use governor::ResourceGovernor;
pub use provider::{
    GeminiAdapter, OpenAiAdapter, ProviderAdapter, ProviderId, ProviderRequest, ProviderResult,
    ProviderSet, StaticProvider,
};
pub use router::{RouteTarget, RoutingDecision, RoutingEngine};
pub use task::{Task, TaskType};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for production log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`GatewayError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), GatewayError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| GatewayError::Other(format!("tracing init failed: {e}")))
}

/// Top-level gateway errors.
///
/// Every failure surface is mapped to a variant here with enough structured
/// detail (identity, window/period, limits) to render an actionable message.
/// Governance failures are expected and user-actionable; audit failures are
/// fatal to the call that triggered them.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A per-identity rate window has no tokens left. No provider call was
    /// made and no budget was consumed.
    #[error(
        "rate limit exceeded for `{identity}`: {limit} requests per {window} \
         (retry in {retry_after_secs}s)"
    )]
    RateLimited {
        /// Identity whose bucket was exhausted.
        identity: String,
        /// Which window (minute or hour) rejected the call.
        window: RateWindow,
        /// Configured capacity of the rejecting window.
        limit: u32,
        /// Seconds until at least one token refills.
        retry_after_secs: u64,
    },

    /// A per-identity budget period is exhausted. No provider call was made.
    #[error("{period} budget exhausted for `{identity}`: spent ${spent:.4} of ${limit:.2}")]
    BudgetExceeded {
        /// Identity whose ledger is exhausted.
        identity: String,
        /// Which period (daily or monthly) rejected the call.
        period: BudgetPeriod,
        /// Running total already spent in the period.
        spent: f64,
        /// Configured limit for the period.
        limit: f64,
    },

    /// Exactly one ensemble leg failed and the survivor produced no usable
    /// score, so no decision could be formed.
    #[error("ensemble partial failure: {failed} failed ({error}); {survivor} gave no usable score")]
    EnsemblePartialFailure {
        /// The provider whose call succeeded but could not be scored.
        survivor: ProviderId,
        /// The provider whose call failed.
        failed: ProviderId,
        /// Error reported by the failed leg.
        error: String,
    },

    /// Both ensemble legs failed.
    #[error("ensemble total failure: openai: {openai}; gemini: {gemini}")]
    EnsembleTotalFailure {
        /// Error reported by the OpenAI leg.
        openai: String,
        /// Error reported by the Gemini leg.
        gemini: String,
    },

    /// An audit event could not be durably appended. The operation that
    /// triggered the append must fail: silent loss of an audit record is
    /// disallowed.
    #[error("audit storage failure: {0}")]
    AuditStorage(String),

    /// The audit appender task is gone; no further events can be recorded.
    #[error("audit channel closed")]
    AuditChannelClosed,

    /// A configuration value is missing or invalid. Returned at construction
    /// time so that misconfiguration surfaces immediately.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}
