use std::collections::BTreeSet;

use async_trait::async_trait;
use enactor_core::{Kind, RecordId, Snapshot};
use serde_json::Value;

use super::{ModelPolicy, PolicyEffect};
use crate::error::Result;
use crate::record::Record;
use crate::store::RecordStore;

/// Keeps one join record per id listed on a source record.
///
/// For `Sliver { networks: [1, 2] }` this maintains
/// `NetworkSliver { sliver: <id>, network: 1 }` and `... network: 2`,
/// deleting joins for ids no longer listed.
#[derive(Debug, Clone)]
pub struct JoinRecordPolicy {
    name: String,
    source: Kind,
    list_field: String,
    join: Kind,
    source_field: String,
    target_field: String,
}

impl JoinRecordPolicy {
    pub fn new(
        source: Kind,
        list_field: impl Into<String>,
        join: Kind,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            name: format!("{}_join", join.as_str().to_lowercase()),
            source,
            list_field: list_field.into(),
            join,
            source_field: source_field.into(),
            target_field: target_field.into(),
        }
    }

    /// `Sliver.networks` → `NetworkSliver { sliver, network }`.
    pub fn network_slivers() -> Self {
        Self::new(
            Kind::from_static("Sliver"),
            "networks",
            Kind::from_static("NetworkSliver"),
            "sliver",
            "network",
        )
    }

    fn wanted(&self, record: &Record) -> BTreeSet<u64> {
        record
            .spec
            .get(&self.list_field)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelPolicy for JoinRecordPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, kind: &Kind) -> bool {
        kind == &self.source
    }

    async fn apply(&self, record: &Record, store: &dyn RecordStore) -> Result<PolicyEffect> {
        let mut missing = self.wanted(record);
        let mut changed = Vec::new();

        let joins = store.list(&self.join).await?;
        for join in joins
            .iter()
            .filter(|j| j.spec_u64(&self.source_field) == Some(record.id.get()))
        {
            // Keep the first join per target; later duplicates and stale
            // targets go.
            let keep = join
                .spec_u64(&self.target_field)
                .is_some_and(|target| missing.remove(&target));
            if !keep {
                store.delete(&join.key()).await?;
                changed.push(join.key());
            }
        }

        for target in missing {
            let mut spec = Snapshot::new();
            spec.insert(self.source_field.clone(), record.id.get().into());
            spec.insert(self.target_field.clone(), target.into());
            let created = store.create(self.join.clone(), spec).await?;
            changed.push(created.key());
        }

        Ok(if changed.is_empty() {
            PolicyEffect::Unchanged
        } else {
            PolicyEffect::Changed(changed)
        })
    }
}

/// Id of the record a join points at through `field`.
pub(super) fn referenced_id(record: &Record, field: &str) -> Option<RecordId> {
    record.spec_u64(field).map(RecordId::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::InMemoryRecordStore;

    async fn sliver(store: &InMemoryRecordStore, networks: Value) -> Record {
        let mut spec = Snapshot::new();
        spec.insert("networks".into(), networks);
        store.create(Kind::new("Sliver").unwrap(), spec).await.unwrap()
    }

    fn targets(joins: &[Record]) -> Vec<u64> {
        let mut targets: Vec<u64> = joins.iter().filter_map(|j| j.spec_u64("network")).collect();
        targets.sort_unstable();
        targets
    }

    #[tokio::test]
    async fn test_creates_missing_joins_once() {
        let store = InMemoryRecordStore::new();
        let record = sliver(&store, json!([1, 2])).await;
        let policy = JoinRecordPolicy::network_slivers();

        let first = policy.apply(&record, &store).await.unwrap();
        let second = policy.apply(&record, &store).await.unwrap();

        assert!(matches!(first, PolicyEffect::Changed(ref keys) if keys.len() == 2));
        assert_eq!(second, PolicyEffect::Unchanged);
        let joins = store.list(&Kind::new("NetworkSliver").unwrap()).await.unwrap();
        assert_eq!(targets(&joins), vec![1, 2]);
        assert!(joins.iter().all(|j| j.spec_u64("sliver") == Some(record.id.get())));
    }

    #[tokio::test]
    async fn test_removes_joins_no_longer_listed() {
        let store = InMemoryRecordStore::new();
        let record = sliver(&store, json!([1, 2])).await;
        let policy = JoinRecordPolicy::network_slivers();
        policy.apply(&record, &store).await.unwrap();

        let mut spec = record.spec.clone();
        spec.insert("networks".into(), json!([2]));
        let updated = store.update_spec(&record.key(), None, spec).await.unwrap();
        policy.apply(&updated, &store).await.unwrap();

        let joins = store.list(&Kind::new("NetworkSliver").unwrap()).await.unwrap();
        assert_eq!(targets(&joins), vec![2]);
    }

    #[test]
    fn test_referenced_id() {
        let mut record = Record::new(
            Kind::new("NetworkSliver").unwrap(),
            RecordId::new(1),
            Snapshot::new(),
        );
        record.spec.insert("network".into(), json!(4));

        assert_eq!(referenced_id(&record, "network"), Some(RecordId::new(4)));
        assert_eq!(referenced_id(&record, "sliver"), None);
    }
}
