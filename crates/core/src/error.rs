//! Core error types shared by every enactor crate.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Core error type for enactor operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid kind: {reason}")]
    InvalidKind { reason: String },
}

impl Error {
    /// Create an invalid kind error.
    pub fn invalid_kind(reason: impl Into<String>) -> Self {
        Self::InvalidKind {
            reason: reason.into(),
        }
    }
}
