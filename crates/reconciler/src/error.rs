//! Error types for the reconciler crate.

use std::fmt;

use enactor_core::RecordKey;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone)]
pub enum Error {
    /// The record does not exist.
    NotFound { key: RecordKey },
    /// The record's spec changed between read and outcome write.
    Conflict { key: RecordKey },
    /// The record spec cannot be enacted as written.
    InvalidSpec { key: RecordKey, reason: String },
    /// A model policy failed.
    PolicyFailed { policy: String, reason: String },
    /// Invalid configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => {
                write!(f, "record '{key}' not found")
            }
            Self::Conflict { key } => {
                write!(f, "record '{key}' changed concurrently")
            }
            Self::InvalidSpec { key, reason } => {
                write!(f, "invalid spec for '{key}': {reason}")
            }
            Self::PolicyFailed { policy, reason } => {
                write!(f, "policy '{policy}' failed: {reason}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a not found error.
    pub fn not_found(key: RecordKey) -> Self {
        Self::NotFound { key }
    }

    /// Create a conflict error.
    pub fn conflict(key: RecordKey) -> Self {
        Self::Conflict { key }
    }

    /// Create an invalid spec error.
    pub fn invalid_spec(key: RecordKey, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            key,
            reason: reason.into(),
        }
    }

    /// Create a policy failed error.
    pub fn policy_failed(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyFailed {
            policy: policy.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True for a compare-and-swap loss.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
