//! Error types for the events crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Publishing a message to the bus failed.
    #[error("publish for client '{identity}' failed: {reason}")]
    PublishFailed { identity: String, reason: String },

    /// The bus channel was closed.
    #[error("event channel closed")]
    ChannelClosed,

    /// A bus payload could not be decoded.
    #[error("event decode failed: {reason}")]
    EventDecode { reason: String },

    /// A deleter plugin manifest could not be loaded.
    #[error("failed to load deleter plugin '{path}': {reason}")]
    PluginLoad { path: PathBuf, reason: String },

    /// The deleter plugin directory could not be read at all.
    #[error("cannot read deleter plugin directory '{path}': {reason}")]
    PluginDirectory { path: PathBuf, reason: String },

    /// Message serialization failed.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl Error {
    /// Create a publish failed error.
    pub fn publish_failed(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishFailed {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Create an event decode error.
    pub fn event_decode(reason: impl Into<String>) -> Self {
        Self::EventDecode {
            reason: reason.into(),
        }
    }

    /// Create a plugin load error.
    pub fn plugin_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PluginLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a plugin directory error.
    pub fn plugin_directory(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PluginDirectory {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }
}
