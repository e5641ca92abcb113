//! Subnet and address allocation for networks.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use enactor_core::{Kind, RecordKey};
use serde_json::Value;

use super::join::referenced_id;
use super::{ModelPolicy, PolicyEffect};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::store::RecordStore;

const SUBNET_FIELD: &str = "subnet";
const ADDRESS_FIELD: &str = "ip";

/// First usable host; `.1` is left to the gateway.
const FIRST_HOST: u32 = 2;
const LAST_HOST: u32 = 254;

/// Write one field into the spec with compare-and-swap.
///
/// A concurrent spec write defers the record to the next pass instead of
/// clobbering it.
async fn set_field(
    store: &dyn RecordStore,
    record: &Record,
    field: &str,
    value: String,
) -> Result<PolicyEffect> {
    let mut spec = record.spec.clone();
    spec.insert(field.to_string(), Value::String(value));

    match store
        .update_spec(&record.key(), Some(record.updated_at), spec)
        .await
    {
        Ok(updated) => Ok(PolicyEffect::Changed(vec![updated.key()])),
        Err(e) if e.is_conflict() => Ok(PolicyEffect::Deferred {
            reason: format!("{} changed concurrently", record.key()),
        }),
        Err(e) => Err(e),
    }
}

/// Gives every `Network` without a subnet the first unused `10.0.X.0/24`.
#[derive(Debug, Clone)]
pub struct SubnetAllocationPolicy {
    kind: Kind,
}

impl SubnetAllocationPolicy {
    pub fn new() -> Self {
        Self {
            kind: Kind::from_static("Network"),
        }
    }

    fn candidates() -> impl Iterator<Item = String> {
        (0..=255u8).map(|x| format!("10.0.{x}.0/24"))
    }
}

impl Default for SubnetAllocationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelPolicy for SubnetAllocationPolicy {
    fn name(&self) -> &str {
        "subnet_allocation"
    }

    fn applies_to(&self, kind: &Kind) -> bool {
        kind == &self.kind
    }

    async fn apply(&self, record: &Record, store: &dyn RecordStore) -> Result<PolicyEffect> {
        if record.spec_str(SUBNET_FIELD).is_some() {
            return Ok(PolicyEffect::Unchanged);
        }

        let used: BTreeSet<String> = store
            .list(&self.kind)
            .await?
            .iter()
            .filter_map(|n| n.spec_str(SUBNET_FIELD).map(str::to_string))
            .collect();

        let subnet = Self::candidates()
            .find(|candidate| !used.contains(candidate))
            .ok_or_else(|| Error::policy_failed(self.name(), "subnet pool 10.0.0.0/16 exhausted"))?;

        set_field(store, record, SUBNET_FIELD, subnet).await
    }
}

/// Gives every `NetworkSliver` without an address the first free host of
/// its network's subnet.
#[derive(Debug, Clone)]
pub struct AddressAllocationPolicy {
    kind: Kind,
    network: Kind,
}

impl AddressAllocationPolicy {
    pub fn new() -> Self {
        Self {
            kind: Kind::from_static("NetworkSliver"),
            network: Kind::from_static("Network"),
        }
    }
}

impl Default for AddressAllocationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Network address of a `a.b.c.d/nn` subnet.
fn subnet_base(subnet: &str) -> Option<Ipv4Addr> {
    subnet.split('/').next()?.parse().ok()
}

#[async_trait]
impl ModelPolicy for AddressAllocationPolicy {
    fn name(&self) -> &str {
        "address_allocation"
    }

    fn applies_to(&self, kind: &Kind) -> bool {
        kind == &self.kind
    }

    async fn apply(&self, record: &Record, store: &dyn RecordStore) -> Result<PolicyEffect> {
        if record.spec_str(ADDRESS_FIELD).is_some() {
            return Ok(PolicyEffect::Unchanged);
        }

        let Some(network_id) = referenced_id(record, "network") else {
            return Err(Error::invalid_spec(record.key(), "network must be a record id"));
        };
        let network_key = RecordKey::new(self.network.clone(), network_id);

        let Some(network) = store.get(&network_key).await? else {
            return Ok(PolicyEffect::Deferred {
                reason: format!("{network_key} does not exist yet"),
            });
        };
        let Some(base) = network.spec_str(SUBNET_FIELD).and_then(subnet_base) else {
            return Ok(PolicyEffect::Deferred {
                reason: format!("{network_key} has no subnet yet"),
            });
        };

        let used: BTreeSet<String> = store
            .list(&self.kind)
            .await?
            .iter()
            .filter(|j| referenced_id(j, "network") == Some(network_id))
            .filter_map(|j| j.spec_str(ADDRESS_FIELD).map(str::to_string))
            .collect();

        let base = u32::from(base);
        let address = (FIRST_HOST..=LAST_HOST)
            .map(|host| Ipv4Addr::from(base.saturating_add(host)).to_string())
            .find(|candidate| !used.contains(candidate))
            .ok_or_else(|| {
                Error::policy_failed(self.name(), format!("no free address in {network_key}"))
            })?;

        set_field(store, record, ADDRESS_FIELD, address).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use enactor_core::Snapshot;
    use serde_json::json;

    use super::*;
    use crate::store::InMemoryRecordStore;

    fn spec(value: Value) -> Snapshot {
        let Value::Object(spec) = value else {
            unreachable!("spec must be an object");
        };
        spec
    }

    #[tokio::test]
    async fn test_allocates_first_unused_subnet() {
        let store = InMemoryRecordStore::new();
        let network = Kind::new("Network").unwrap();
        store
            .create(network.clone(), spec(json!({"subnet": "10.0.0.0/24"})))
            .await
            .unwrap();
        let fresh = store.create(network.clone(), Snapshot::new()).await.unwrap();
        let policy = SubnetAllocationPolicy::new();

        let effect = policy.apply(&fresh, &store).await.unwrap();

        assert!(matches!(effect, PolicyEffect::Changed(_)));
        let stored = store.get(&fresh.key()).await.unwrap().unwrap();
        assert_eq!(stored.spec_str("subnet"), Some("10.0.1.0/24"));
        assert_eq!(policy.apply(&stored, &store).await.unwrap(), PolicyEffect::Unchanged);
    }

    #[tokio::test]
    async fn test_allocates_first_free_host_address() {
        let store = InMemoryRecordStore::new();
        let network = store
            .create(
                Kind::new("Network").unwrap(),
                spec(json!({"subnet": "10.0.3.0/24"})),
            )
            .await
            .unwrap();
        let join = Kind::new("NetworkSliver").unwrap();
        store
            .create(join.clone(), spec(json!({"network": network.id.get(), "ip": "10.0.3.2"})))
            .await
            .unwrap();
        let fresh = store
            .create(join.clone(), spec(json!({"network": network.id.get(), "sliver": 9})))
            .await
            .unwrap();

        AddressAllocationPolicy::new().apply(&fresh, &store).await.unwrap();

        let stored = store.get(&fresh.key()).await.unwrap().unwrap();
        assert_eq!(stored.spec_str("ip"), Some("10.0.3.3"));
    }

    #[tokio::test]
    async fn test_defers_address_until_network_has_subnet() {
        let store = InMemoryRecordStore::new();
        let network = store
            .create(Kind::new("Network").unwrap(), Snapshot::new())
            .await
            .unwrap();
        let join = store
            .create(
                Kind::new("NetworkSliver").unwrap(),
                spec(json!({"network": network.id.get()})),
            )
            .await
            .unwrap();

        let effect = AddressAllocationPolicy::new().apply(&join, &store).await.unwrap();

        assert!(matches!(effect, PolicyEffect::Deferred { .. }));
    }

    #[tokio::test]
    async fn test_conflicting_write_is_deferred() {
        let store = InMemoryRecordStore::new();
        let stale = store
            .create(Kind::new("Network").unwrap(), Snapshot::new())
            .await
            .unwrap();
        store
            .update_spec(&stale.key(), None, spec(json!({"name": "renamed"})))
            .await
            .unwrap();

        let effect = SubnetAllocationPolicy::new().apply(&stale, &store).await.unwrap();

        assert!(matches!(effect, PolicyEffect::Deferred { .. }));
    }
}
