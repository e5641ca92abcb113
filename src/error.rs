//! Error types for the enactor binary.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for startup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Startup error types. Anything here stops the process.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file did not parse.
    #[error("failed to parse config '{path}': {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Seed records could not be loaded.
    #[error("failed to load seed records '{path}': {reason}")]
    Seed { path: PathBuf, reason: String },

    #[error(transparent)]
    Events(#[from] enactor_events::Error),

    #[error(transparent)]
    Reconciler(#[from] enactor_reconciler::Error),
}

impl Error {
    /// Create a config parse error.
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a seed error.
    pub fn seed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Seed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
