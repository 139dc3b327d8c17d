//! Configuration error types following panic-free policy.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown/mistyped keys
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override could not be parsed
    #[error("Invalid value for {var}: {value} (expected {expected})")]
    InvalidEnv {
        var: String,
        value: String,
        expected: String,
    },

    /// A field failed validation
    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
