//! Semantic validation of gateway configuration.
//!
//! ## Responsibility
//! Check constraints that the TOML type system cannot express: threshold
//! ranges, positive limits, ordering between related values.
//!
//! ## NOT Responsible For
//! - Reading or parsing files (that belongs to `loader`)
//! - Defining the config schema (that belongs to `mod.rs`)

use thiserror::Error;

use super::GatewayConfig;

/// Errors produced while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file `{file}`: {source}")]
    Io {
        /// Path of the file that failed to read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file content is not well-formed TOML.
    #[error("cannot parse config `{file}`: {source}")]
    Parse {
        /// Source name used in the error message.
        file: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic constraints are violated.
    #[error("invalid configuration:\n{0}")]
    Validation(String),
}

/// Validate all semantic constraints on a parsed configuration.
///
/// Returns every violation found, not just the first, so operators can fix
/// a config in one pass.
///
/// # Errors
///
/// Returns the full list of violations as strings.
pub fn validate(config: &GatewayConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if !(0.0..=1.0).contains(&config.routing.impact_threshold) {
        errors.push(format!(
            "routing.impact_threshold must be in [0, 1], got {}",
            config.routing.impact_threshold
        ));
    }

    if config.ensemble.deviation_threshold < 0.0 || config.ensemble.deviation_threshold > 100.0 {
        errors.push(format!(
            "ensemble.deviation_threshold must be in [0, 100], got {}",
            config.ensemble.deviation_threshold
        ));
    }

    if config.ensemble.consensus_band > config.ensemble.deviation_threshold {
        errors.push(format!(
            "ensemble.consensus_band ({}) must not exceed deviation_threshold ({})",
            config.ensemble.consensus_band, config.ensemble.deviation_threshold
        ));
    }

    if config.ensemble.partial_confidence_penalty <= 0.0
        || config.ensemble.partial_confidence_penalty > 1.0
    {
        errors.push(format!(
            "ensemble.partial_confidence_penalty must be in (0, 1], got {}",
            config.ensemble.partial_confidence_penalty
        ));
    }

    if config.budget.daily_limit_usd <= 0.0 {
        errors.push(format!(
            "budget.daily_limit_usd must be positive, got {}",
            config.budget.daily_limit_usd
        ));
    }

    if config.budget.monthly_limit_usd < config.budget.daily_limit_usd {
        errors.push(format!(
            "budget.monthly_limit_usd ({}) must be at least daily_limit_usd ({})",
            config.budget.monthly_limit_usd, config.budget.daily_limit_usd
        ));
    }

    if config.cache.ttl_secs == 0 {
        errors.push("cache.ttl_secs must be positive".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
