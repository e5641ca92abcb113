//! Result type definition and logging combinators.
//!
//! Code that must keep running after a failed call uses these helpers to
//! report the failure and carry on.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for any `Result`.
pub trait ResultExt<T> {
    /// Convert to an Option, logging the error at `error` level if present.
    fn into_option_logged(self, context: &str) -> Option<T>;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "{context}");
                None
            }
        }
    }
}
