//! Bus message format.
//!
//! One JSON object per event:
//!
//! ```json
//! { "model": "Sliver", "pk": 42, "delete_flag": true,
//!   "model_dict": { "name": "vm1" }, "uuid": "…", "timestamp": "…" }
//! ```

use chrono::{DateTime, Utc};
use enactor_core::{Kind, RecordId, RecordKey, Snapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Enumerated event tag used for listener dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A record was created or its spec changed.
    Change,
    /// A record was deleted; the message carries its last snapshot.
    Deletion,
}

/// A single bus event about one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Message id; absent on messages from producers that do not stamp one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(rename = "model")]
    pub kind: Kind,
    #[serde(rename = "pk")]
    pub id: RecordId,
    #[serde(default)]
    pub delete_flag: bool,
    /// Field values of the record when the event was produced.
    #[serde(rename = "model_dict", default)]
    pub snapshot: Snapshot,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    /// Create a change event.
    pub fn change(kind: Kind, id: RecordId, snapshot: Snapshot) -> Self {
        Self {
            uuid: Some(Uuid::new_v4()),
            kind,
            id,
            delete_flag: false,
            snapshot,
            timestamp: Utc::now(),
        }
    }

    /// Create a deletion event carrying the record's final snapshot.
    pub fn deletion(kind: Kind, id: RecordId, snapshot: Snapshot) -> Self {
        Self {
            delete_flag: true,
            ..Self::change(kind, id, snapshot)
        }
    }

    /// Get the event tag.
    pub fn event_kind(&self) -> EventKind {
        if self.delete_flag {
            EventKind::Deletion
        } else {
            EventKind::Change
        }
    }

    /// Get the addressed record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind.clone(), self.id)
    }

    /// Encode to the wire format.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Result of decoding a raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A well-formed deletion.
    Deletion(EventMessage),
    /// A non-deletion event; change events are only a trigger, so a partial
    /// message still counts.
    Change(Option<EventMessage>),
    /// `delete_flag` was set but the deletion fields did not decode.
    MalformedDeletion { reason: String },
}

/// Decode a raw bus payload.
///
/// Only payloads that are not a JSON object fail; everything else maps to a
/// [`Decoded`] variant.
pub fn decode(payload: &str) -> Result<Decoded> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| Error::event_decode(e.to_string()))?;

    if !value.is_object() {
        return Err(Error::event_decode("payload is not a JSON object"));
    }

    let delete_flag = value
        .get("delete_flag")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let message = serde_json::from_value::<EventMessage>(value);

    Ok(match (delete_flag, message) {
        (true, Ok(message)) => Decoded::Deletion(message),
        (true, Err(e)) => Decoded::MalformedDeletion {
            reason: e.to_string(),
        },
        (false, message) => Decoded::Change(message.ok()),
    })
}
