//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`GatewayConfig`], and run
//! validation before returning. This is the primary entry point for loading
//! gateway configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - The file path is included in every error message

use std::path::Path;

use super::validation::{self, ConfigError};
use super::GatewayConfig;

/// Load a [`GatewayConfig`] from a TOML file.
///
/// # Errors
///
/// - [`ConfigError::Io`] if the file cannot be read.
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
pub fn load_from_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`GatewayConfig`] from a TOML string.
///
/// Useful for testing or embedding configs without file I/O. `source_name`
/// identifies the source in error messages.
///
/// # Errors
///
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
pub fn load_from_str(content: &str, source_name: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config)
        .map_err(|errors| ConfigError::Validation(errors.join("\n")))?;

    Ok(config)
}
