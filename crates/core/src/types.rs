//! Identifiers shared by the bus, the record store and the observer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Attribute map of a record: its declared spec, or the snapshot carried by a
/// deletion event.
pub type Snapshot = serde_json::Map<String, serde_json::Value>;

/// Resource type tag such as `Sliver`, `Network` or `SitePrivilege`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kind(String);

impl Kind {
    /// Create a kind, rejecting empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_kind("kind name must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Kind for a built-in, compile-time name. The name must not be blank.
    #[must_use]
    pub fn from_static(name: &'static str) -> Self {
        debug_assert!(!name.trim().is_empty());
        Self(name.to_string())
    }

    /// Get the kind name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Kind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Kind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a record within its kind (the wire `pk`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified record address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: Kind,
    pub id: RecordId,
}

impl RecordKey {
    /// Create a key from its parts.
    #[must_use]
    pub const fn new(kind: Kind, id: RecordId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
