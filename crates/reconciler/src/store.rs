//! Record store trait and implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use enactor_core::{Kind, RecordId, RecordKey, Snapshot};
use enactor_events::EventSender;
use itertools::Itertools;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::{Outcome, Record, STATUS_OK};

/// Trait for record storage backends.
///
/// Outcome writes are compare-and-swap on `updated_at`: if the spec moved
/// since the caller read it, the write fails with [`Error::Conflict`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Kinds that currently hold at least one record.
    async fn kinds(&self) -> Result<Vec<Kind>>;

    /// Read one record.
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// All records of a kind, ordered by id.
    async fn list(&self, kind: &Kind) -> Result<Vec<Record>>;

    /// Records of a kind that need enactment, ordered by id.
    async fn pending(&self, kind: &Kind) -> Result<Vec<Record>>;

    /// Records whose spec changed at or after `since`; all records for `None`.
    async fn changed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>>;

    /// Create a record with the next free id of its kind.
    async fn create(&self, kind: Kind, spec: Snapshot) -> Result<Record>;

    /// Insert or replace a record as given.
    async fn put(&self, record: Record) -> Result<()>;

    /// Replace the spec, bumping `updated_at`.
    ///
    /// With `expected` set, the write only succeeds if `updated_at` still
    /// matches it.
    async fn update_spec(
        &self,
        key: &RecordKey,
        expected: Option<DateTime<Utc>>,
        spec: Snapshot,
    ) -> Result<Record>;

    /// Record an enactment outcome if `updated_at` still equals `expected`.
    async fn record_outcome(
        &self,
        key: &RecordKey,
        expected: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<Record>;

    /// Store the backend id without touching enactment state.
    async fn record_backend_id(&self, key: &RecordKey, backend_id: Option<String>) -> Result<()>;

    /// Delete a record, returning its final state.
    async fn delete(&self, key: &RecordKey) -> Result<Record>;
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<RecordKey, Record>,
    clock: Option<DateTime<Utc>>,
}

impl State {
    /// Strictly increasing timestamps, so a spec write is never hidden by an
    /// enactment stamped in the same instant.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last
                .checked_add_signed(Duration::microseconds(1))
                .unwrap_or(last),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn get_mut(&mut self, key: &RecordKey) -> Result<&mut Record> {
        self.records
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key.clone()))
    }
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: RwLock<State>,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// True when the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn kinds(&self) -> Result<Vec<Kind>> {
        let state = self.state.read().await;
        Ok(state.records.keys().map(|k| k.kind.clone()).dedup().collect())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.state.read().await.records.get(key).cloned())
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| &r.kind == kind)
            .cloned()
            .collect())
    }

    async fn pending(&self, kind: &Kind) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| &r.kind == kind && r.needs_enactment())
            .cloned()
            .collect())
    }

    async fn changed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| since.map_or(true, |since| r.updated_at >= since))
            .cloned()
            .collect())
    }

    async fn create(&self, kind: Kind, spec: Snapshot) -> Result<Record> {
        let mut state = self.state.write().await;
        let next_id = state
            .records
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.id.get())
            .max()
            .map_or(1, |max| max.saturating_add(1));

        let mut record = Record::new(kind, RecordId::new(next_id), spec);
        record.updated_at = state.tick();
        state.records.insert(record.key(), record.clone());
        Ok(record)
    }

    async fn put(&self, record: Record) -> Result<()> {
        let mut state = self.state.write().await;
        // Keep the clock ahead of seeded timestamps.
        if state.clock.map_or(true, |clock| clock < record.updated_at) {
            state.clock = Some(record.updated_at);
        }
        state.records.insert(record.key(), record);
        Ok(())
    }

    async fn update_spec(
        &self,
        key: &RecordKey,
        expected: Option<DateTime<Utc>>,
        spec: Snapshot,
    ) -> Result<Record> {
        let mut state = self.state.write().await;
        let now = state.tick();
        let record = state.get_mut(key)?;

        if expected.is_some_and(|expected| expected != record.updated_at) {
            return Err(Error::conflict(key.clone()));
        }

        record.spec = spec;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn record_outcome(
        &self,
        key: &RecordKey,
        expected: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<Record> {
        let mut state = self.state.write().await;
        let now = state.tick();
        let record = state.get_mut(key)?;

        if record.updated_at != expected {
            return Err(Error::conflict(key.clone()));
        }

        match outcome {
            Outcome::Enacted { backend_id } => {
                record.enacted_at = Some(now);
                record.backend_status = STATUS_OK.to_string();
                record.backend_id = backend_id;
            }
            Outcome::Deferred { status } => {
                record.backend_status = status;
            }
            Outcome::Failed { status } => {
                record.backend_status = status;
                record.failed_at = Some(now);
            }
        }
        Ok(record.clone())
    }

    async fn record_backend_id(&self, key: &RecordKey, backend_id: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        state.get_mut(key)?.backend_id = backend_id;
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<Record> {
        let mut state = self.state.write().await;
        state
            .records
            .remove(key)
            .ok_or_else(|| Error::not_found(key.clone()))
    }
}

/// A wrapper that publishes bus events for spec writes and deletions.
///
/// Outcome writes are not published: they never make a record pending.
/// Publish failures are logged; the write itself has already committed and
/// the observer's periodic scan still picks the record up.
pub struct NotifyingRecordStore<S: RecordStore> {
    inner: S,
    sender: EventSender,
}

impl<S: RecordStore> NotifyingRecordStore<S> {
    /// Create a notifying store.
    pub fn new(inner: S, sender: EventSender) -> Self {
        Self { inner, sender }
    }

    async fn notify(&self, record: &Record, delete_flag: bool) {
        let result = self
            .sender
            .fire(record.kind.clone(), record.id, delete_flag, record.snapshot())
            .await;

        match result {
            Ok(uuid) => debug!(key = %record.key(), uuid = %uuid, delete_flag, "Published record event"),
            Err(e) => warn!(key = %record.key(), delete_flag, error = %e, "Failed to publish record event"),
        }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for NotifyingRecordStore<S> {
    async fn kinds(&self) -> Result<Vec<Kind>> {
        self.inner.kinds().await
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.inner.get(key).await
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<Record>> {
        self.inner.list(kind).await
    }

    async fn pending(&self, kind: &Kind) -> Result<Vec<Record>> {
        self.inner.pending(kind).await
    }

    async fn changed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        self.inner.changed_since(since).await
    }

    async fn create(&self, kind: Kind, spec: Snapshot) -> Result<Record> {
        let record = self.inner.create(kind, spec).await?;
        self.notify(&record, false).await;
        Ok(record)
    }

    async fn put(&self, record: Record) -> Result<()> {
        self.inner.put(record.clone()).await?;
        self.notify(&record, false).await;
        Ok(())
    }

    async fn update_spec(
        &self,
        key: &RecordKey,
        expected: Option<DateTime<Utc>>,
        spec: Snapshot,
    ) -> Result<Record> {
        let record = self.inner.update_spec(key, expected, spec).await?;
        self.notify(&record, false).await;
        Ok(record)
    }

    async fn record_outcome(
        &self,
        key: &RecordKey,
        expected: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<Record> {
        self.inner.record_outcome(key, expected, outcome).await
    }

    async fn record_backend_id(&self, key: &RecordKey, backend_id: Option<String>) -> Result<()> {
        self.inner.record_backend_id(key, backend_id).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<Record> {
        let record = self.inner.delete(key).await?;
        self.notify(&record, true).await;
        Ok(record)
    }
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn kinds(&self) -> Result<Vec<Kind>> {
        (**self).kinds().await
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        (**self).get(key).await
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<Record>> {
        (**self).list(kind).await
    }

    async fn pending(&self, kind: &Kind) -> Result<Vec<Record>> {
        (**self).pending(kind).await
    }

    async fn changed_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        (**self).changed_since(since).await
    }

    async fn create(&self, kind: Kind, spec: Snapshot) -> Result<Record> {
        (**self).create(kind, spec).await
    }

    async fn put(&self, record: Record) -> Result<()> {
        (**self).put(record).await
    }

    async fn update_spec(
        &self,
        key: &RecordKey,
        expected: Option<DateTime<Utc>>,
        spec: Snapshot,
    ) -> Result<Record> {
        (**self).update_spec(key, expected, spec).await
    }

    async fn record_outcome(
        &self,
        key: &RecordKey,
        expected: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<Record> {
        (**self).record_outcome(key, expected, outcome).await
    }

    async fn record_backend_id(&self, key: &RecordKey, backend_id: Option<String>) -> Result<()> {
        (**self).record_backend_id(key, backend_id).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<Record> {
        (**self).delete(key).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use enactor_events::{ClientIdentity, EventBus, IdentitySource, InMemoryEventBus};

    use super::*;

    fn kind(name: &str) -> Kind {
        Kind::new(name).unwrap()
    }

    fn spec(name: &str) -> Snapshot {
        let mut spec = Snapshot::new();
        spec.insert("name".into(), name.into());
        spec
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids_per_kind() {
        let store = InMemoryRecordStore::new();

        let a = store.create(kind("Sliver"), spec("a")).await.unwrap();
        let b = store.create(kind("Sliver"), spec("b")).await.unwrap();
        let n = store.create(kind("Network"), spec("n")).await.unwrap();

        assert_eq!(a.id, RecordId::new(1));
        assert_eq!(b.id, RecordId::new(2));
        assert_eq!(n.id, RecordId::new(1));
        assert_eq!(store.kinds().await.unwrap(), vec![kind("Network"), kind("Sliver")]);
    }

    #[tokio::test]
    async fn test_outcome_write_is_compare_and_swap() {
        let store = InMemoryRecordStore::new();
        let record = store.create(kind("Sliver"), spec("a")).await.unwrap();
        let read_at = record.updated_at;

        store
            .update_spec(&record.key(), None, spec("b"))
            .await
            .unwrap();
        let result = store
            .record_outcome(&record.key(), read_at, Outcome::Enacted { backend_id: None })
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(store.pending(&kind("Sliver")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enacted_record_leaves_pending_set() {
        let store = InMemoryRecordStore::new();
        let record = store.create(kind("Sliver"), spec("a")).await.unwrap();

        let enacted = store
            .record_outcome(
                &record.key(),
                record.updated_at,
                Outcome::Enacted {
                    backend_id: Some("i-1".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(enacted.backend_status, STATUS_OK);
        assert!(enacted.enacted_at.unwrap() > enacted.updated_at);
        assert!(store.pending(&kind("Sliver")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_record_is_excluded_until_spec_changes() {
        let store = InMemoryRecordStore::new();
        let record = store.create(kind("Sliver"), spec("a")).await.unwrap();

        store
            .record_outcome(
                &record.key(),
                record.updated_at,
                Outcome::Failed {
                    status: "failed: bad".into(),
                },
            )
            .await
            .unwrap();
        assert!(store.pending(&kind("Sliver")).await.unwrap().is_empty());

        store
            .update_spec(&record.key(), None, spec("fixed"))
            .await
            .unwrap();
        assert_eq!(store.pending(&kind("Sliver")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_since_filters_by_marker() {
        let store = InMemoryRecordStore::new();
        let old = store.create(kind("Network"), spec("old")).await.unwrap();
        let fresh = store.create(kind("Network"), spec("new")).await.unwrap();

        let changed = store.changed_since(Some(fresh.updated_at)).await.unwrap();

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, fresh.id);
        assert_eq!(store.changed_since(None).await.unwrap().len(), 2);
        assert!(old.updated_at < fresh.updated_at);
    }

    #[tokio::test]
    async fn test_notifying_store_publishes_deletion_snapshot() {
        let bus = Arc::new(InMemoryEventBus::new());
        let identity = ClientIdentity::new("writer").unwrap();
        let mut sub = bus.subscribe(&identity).await.unwrap();
        let source = Arc::new(IdentitySource::new("/unused").with_configured(Some(identity)));
        let store = NotifyingRecordStore::new(
            InMemoryRecordStore::new(),
            EventSender::new(bus.clone(), source),
        );

        let record = store.create(kind("Sliver"), spec("vm1")).await.unwrap();
        store
            .record_backend_id(&record.key(), Some("i-9".into()))
            .await
            .unwrap();
        store.delete(&record.key()).await.unwrap();

        let created: serde_json::Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        let deleted: serde_json::Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(created["delete_flag"], false);
        assert_eq!(deleted["delete_flag"], true);
        assert_eq!(deleted["model_dict"]["backend_id"], "i-9");
        assert_eq!(deleted["model_dict"]["name"], "vm1");
    }
}
