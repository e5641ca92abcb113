//! Reconcilable records.

use chrono::{DateTime, Utc};
use enactor_core::{Kind, RecordId, RecordKey, Snapshot};
use serde::{Deserialize, Serialize};

/// Status written on successful enactment.
pub const STATUS_OK: &str = "OK";

/// A declared resource and its enactment bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: Kind,
    pub id: RecordId,
    /// Desired attributes.
    #[serde(default)]
    pub spec: Snapshot,
    /// Last spec modification. Only spec writes move it.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub enacted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backend_status: String,
    /// Identifier returned by the backend on creation.
    #[serde(default)]
    pub backend_id: Option<String>,
    /// Last permanent failure.
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a fresh, never enacted record.
    pub fn new(kind: Kind, id: RecordId, spec: Snapshot) -> Self {
        Self {
            kind,
            id,
            spec,
            updated_at: Utc::now(),
            enacted_at: None,
            backend_status: String::new(),
            backend_id: None,
            failed_at: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind.clone(), self.id)
    }

    /// The spec has changes the backend has not seen.
    pub fn is_pending(&self) -> bool {
        self.enacted_at.map_or(true, |enacted| enacted < self.updated_at)
    }

    /// A permanent failure was recorded for the current spec.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some_and(|failed| failed >= self.updated_at)
    }

    /// Pending and not parked by a permanent failure.
    pub fn needs_enactment(&self) -> bool {
        self.is_pending() && !self.is_failed()
    }

    /// Spec fields plus backend bookkeeping, as carried by deletion events.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.spec.clone();
        snapshot.insert("id".into(), self.id.get().into());
        if let Some(backend_id) = &self.backend_id {
            snapshot.insert("backend_id".into(), backend_id.clone().into());
        }
        snapshot.insert("backend_status".into(), self.backend_status.clone().into());
        snapshot
    }

    /// String field of the spec.
    pub fn spec_str(&self, field: &str) -> Option<&str> {
        self.spec.get(field).and_then(serde_json::Value::as_str)
    }

    /// Unsigned integer field of the spec.
    pub fn spec_u64(&self, field: &str) -> Option<u64> {
        self.spec.get(field).and_then(serde_json::Value::as_u64)
    }
}

/// Result of one enactment attempt, written with compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The backend converged; the record is no longer pending.
    Enacted { backend_id: Option<String> },
    /// Transient failure; the record stays pending.
    Deferred { status: String },
    /// Permanent failure; parked until the spec changes.
    Failed { status: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record() -> Record {
        Record::new(Kind::new("Sliver").unwrap(), RecordId::new(1), Snapshot::new())
    }

    #[test]
    fn test_new_record_is_pending() {
        assert!(record().is_pending());
        assert!(record().needs_enactment());
    }

    #[test]
    fn test_enacted_record_pends_again_after_spec_change() {
        let mut record = record();
        record.enacted_at = Some(record.updated_at);
        assert!(!record.is_pending());

        record.updated_at = record.updated_at + Duration::seconds(1);
        assert!(record.is_pending());
    }

    #[test]
    fn test_failure_parks_until_spec_changes() {
        let mut record = record();
        record.failed_at = Some(record.updated_at);
        assert!(record.is_failed());
        assert!(!record.needs_enactment());

        record.updated_at = record.updated_at + Duration::milliseconds(1);
        assert!(record.needs_enactment());
    }

    #[test]
    fn test_snapshot_carries_backend_id() {
        let mut record = record();
        record.spec.insert("name".into(), "vm1".into());
        record.backend_id = Some("i-123".into());

        let snapshot = record.snapshot();

        assert_eq!(snapshot["name"], "vm1");
        assert_eq!(snapshot["backend_id"], "i-123");
        assert_eq!(snapshot["id"], 1);
    }

    #[test]
    fn test_deserialize_seed_with_defaults() {
        let record: Record =
            serde_json::from_str(r#"{"kind":"Network","id":5,"spec":{"name":"private"}}"#)
                .unwrap();

        assert_eq!(record.kind.as_str(), "Network");
        assert!(record.needs_enactment());
        assert!(record.backend_id.is_none());
    }
}
