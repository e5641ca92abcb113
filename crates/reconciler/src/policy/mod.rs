//! Model policies: cross-record side effects evaluated on their own cadence.
//!
//! Each pass reads the records whose spec changed since the previous pass
//! started and applies every matching policy to them. Policies must be
//! idempotent; applying one to a consistent state yields
//! [`PolicyEffect::Unchanged`]. Records a policy could not finish yet are
//! carried into the next pass.

mod allocation;
mod join;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enactor_core::{Kind, RecordKey};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use allocation::{AddressAllocationPolicy, SubnetAllocationPolicy};
pub use join::JoinRecordPolicy;

use crate::error::Result;
use crate::record::Record;
use crate::store::RecordStore;

/// What a policy did to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEffect {
    Unchanged,
    /// Records created, updated or deleted.
    Changed(Vec<RecordKey>),
    /// A prerequisite is missing; retry on the next pass.
    Deferred { reason: String },
}

/// A cross-record rule.
#[async_trait]
pub trait ModelPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether records of `kind` are subject to this policy.
    fn applies_to(&self, kind: &Kind) -> bool;

    /// Bring the records related to `record` into line.
    async fn apply(&self, record: &Record, store: &dyn RecordStore) -> Result<PolicyEffect>;
}

/// Configuration for the policy runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Service observers run without model policies.
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
        }
    }
}

/// Counts for one policy pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyReport {
    pub evaluated: usize,
    pub changed: usize,
    pub deferred: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct RunnerState {
    /// Start of the previous pass.
    marker: Option<DateTime<Utc>>,
    carried: BTreeSet<RecordKey>,
}

/// Applies model policies to changed records.
pub struct PolicyRunner {
    store: Arc<dyn RecordStore>,
    policies: Vec<Arc<dyn ModelPolicy>>,
    config: PolicyConfig,
    state: Mutex<RunnerState>,
}

impl PolicyRunner {
    /// Create a runner without policies.
    pub fn new(store: Arc<dyn RecordStore>, config: PolicyConfig) -> Self {
        Self {
            store,
            policies: Vec::new(),
            config,
            state: Mutex::new(RunnerState::default()),
        }
    }

    /// Add a policy. Policies run in the order they were added.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ModelPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Add the network policies: sliver/network joins, subnet and address
    /// allocation.
    #[must_use]
    pub fn with_builtin_policies(self) -> Self {
        self.with_policy(Arc::new(JoinRecordPolicy::network_slivers()))
            .with_policy(Arc::new(SubnetAllocationPolicy::new()))
            .with_policy(Arc::new(AddressAllocationPolicy::new()))
    }

    /// Names of the registered policies.
    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// Run one pass.
    pub async fn run_pass(&self) -> Result<PolicyReport> {
        let mut state = self.state.lock().await;
        let started = Utc::now();
        let mut report = PolicyReport::default();

        let mut keys: Vec<RecordKey> = self
            .store
            .changed_since(state.marker)
            .await?
            .iter()
            .map(Record::key)
            .collect();
        let carried: Vec<RecordKey> = std::mem::take(&mut state.carried)
            .into_iter()
            .filter(|k| !keys.contains(k))
            .collect();
        keys.extend(carried);

        for key in keys {
            for policy in self.policies.iter().filter(|p| p.applies_to(&key.kind)) {
                // Re-read: an earlier policy may have rewritten the record.
                let record = match self.store.get(&key).await {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to read record for policies");
                        state.carried.insert(key.clone());
                        report.errors = report.errors.saturating_add(1);
                        break;
                    }
                };

                report.evaluated = report.evaluated.saturating_add(1);
                match policy.apply(&record, self.store.as_ref()).await {
                    Ok(PolicyEffect::Unchanged) => {}
                    Ok(PolicyEffect::Changed(changed)) => {
                        debug!(policy = policy.name(), key = %key, changed = ?changed, "Policy applied");
                        report.changed = report.changed.saturating_add(changed.len());
                    }
                    Ok(PolicyEffect::Deferred { reason }) => {
                        debug!(policy = policy.name(), key = %key, reason = %reason, "Policy deferred");
                        state.carried.insert(key.clone());
                        report.deferred = report.deferred.saturating_add(1);
                    }
                    Err(e) => {
                        warn!(policy = policy.name(), key = %key, error = %e, "Policy failed");
                        state.carried.insert(key.clone());
                        report.errors = report.errors.saturating_add(1);
                    }
                }
            }
        }

        state.marker = Some(started);

        if report.changed > 0 || report.errors > 0 {
            info!(
                evaluated = report.evaluated,
                changed = report.changed,
                deferred = report.deferred,
                errors = report.errors,
                "Policy pass complete"
            );
        }
        Ok(report)
    }

    /// Run passes on the configured interval until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Model policies disabled");
            return;
        }
        info!(policies = ?self.policy_names(), "Policy runner started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_pass().await {
                warn!(error = %e, "Policy pass failed");
            }
        }

        info!("Policy runner stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use enactor_core::Snapshot;

    use super::*;
    use crate::error::Error;
    use crate::store::InMemoryRecordStore;

    /// Fails the first time, succeeds afterwards.
    #[derive(Default)]
    struct FlakyPolicy {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelPolicy for FlakyPolicy {
        fn name(&self) -> &str {
            "flaky"
        }

        fn applies_to(&self, kind: &Kind) -> bool {
            kind.as_str() == "Sliver"
        }

        async fn apply(&self, _record: &Record, _store: &dyn RecordStore) -> Result<PolicyEffect> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::policy_failed("flaky", "first call"))
            } else {
                Ok(PolicyEffect::Unchanged)
            }
        }
    }

    #[tokio::test]
    async fn test_marker_limits_pass_to_changed_records() {
        let store = InMemoryRecordStore::new_arc();
        store
            .create(Kind::new("Sliver").unwrap(), Snapshot::new())
            .await
            .unwrap();
        let runner = PolicyRunner::new(store, PolicyConfig::default())
            .with_policy(Arc::new(FlakyPolicy::default()));

        let first = runner.run_pass().await.unwrap();
        let second = runner.run_pass().await.unwrap();
        let third = runner.run_pass().await.unwrap();

        assert_eq!(first.errors, 1);
        assert_eq!(second.evaluated, 1, "failed record is carried over");
        assert_eq!(second.errors, 0);
        assert_eq!(third.evaluated, 0);
    }

    #[tokio::test]
    async fn test_disabled_runner_returns_immediately() {
        let runner = PolicyRunner::new(
            InMemoryRecordStore::new_arc(),
            PolicyConfig {
                enabled: false,
                ..PolicyConfig::default()
            },
        );
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(1), runner.run(rx))
            .await
            .unwrap();
    }
}
