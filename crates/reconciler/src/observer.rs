//! Observer loop: drives pending records to convergence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use enactor_core::{Kind, RecordKey};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::RetryTracker;
use crate::driver::{classify, BackendDriver, BackendError, ErrorClass};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::record::{Outcome, Record};
use crate::store::RecordStore;
use crate::wake::WakeSignal;

/// Configuration for the observer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Longest sleep between passes when nothing wakes the loop.
    pub interval: Duration,
    /// Upper bound on one backend call.
    pub backend_timeout: Duration,
    /// First retry delay after a transient failure.
    pub backoff_base: Duration,
    /// Retry delays stop growing here.
    pub backoff_max: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            backend_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// What happened to one record in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Enacted,
    Deferred,
    Failed,
    Skipped,
    Conflict,
}

/// Counts for one observer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub enacted: usize,
    pub deferred: usize,
    pub failed: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

impl PassReport {
    fn add(&mut self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Enacted => &mut self.enacted,
            RecordOutcome::Deferred => &mut self.deferred,
            RecordOutcome::Failed => &mut self.failed,
            RecordOutcome::Skipped => &mut self.skipped,
            RecordOutcome::Conflict => &mut self.conflicts,
        };
        *counter = counter.saturating_add(1);
    }

    fn merge(mut self, other: Self) -> Self {
        self.enacted = self.enacted.saturating_add(other.enacted);
        self.deferred = self.deferred.saturating_add(other.deferred);
        self.failed = self.failed.saturating_add(other.failed);
        self.skipped = self.skipped.saturating_add(other.skipped);
        self.conflicts = self.conflicts.saturating_add(other.conflicts);
        self
    }

    /// Records touched in the pass.
    pub fn total(&self) -> usize {
        [self.deferred, self.failed, self.skipped, self.conflicts]
            .into_iter()
            .fold(self.enacted, usize::saturating_add)
    }

    /// Nothing was left for a later pass.
    pub fn is_converged(&self) -> bool {
        self.deferred == 0 && self.conflicts == 0
    }
}

/// Scans the record store and converges pending records on the backend.
pub struct Observer {
    store: Arc<dyn RecordStore>,
    driver: Arc<dyn BackendDriver>,
    wake: WakeSignal,
    config: ObserverConfig,
    kind_locks: DashMap<Kind, Arc<Mutex<()>>>,
    retries: RetryTracker,
    passes: AtomicU64,
}

impl Observer {
    /// Start building an observer.
    pub fn builder() -> ObserverBuilder {
        ObserverBuilder::new()
    }

    /// Signal that wakes this observer early.
    pub fn wake_signal(&self) -> WakeSignal {
        self.wake.clone()
    }

    /// Completed passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    fn kind_lock(&self, kind: &Kind) -> Arc<Mutex<()>> {
        Arc::clone(
            self.kind_locks
                .entry(kind.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Run one pass over every kind.
    ///
    /// Kinds converge concurrently; records within a kind run one at a time.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let kinds = self.store.kinds().await?;
        debug!(kinds = kinds.len(), "Starting observer pass");

        let reports = join_all(kinds.iter().map(|kind| self.converge_kind(kind))).await;
        let report = reports.into_iter().fold(PassReport::default(), PassReport::merge);

        self.passes.fetch_add(1, Ordering::SeqCst);

        if report.total() > 0 {
            info!(
                enacted = report.enacted,
                deferred = report.deferred,
                failed = report.failed,
                skipped = report.skipped,
                conflicts = report.conflicts,
                "Observer pass complete"
            );
        }
        Ok(report)
    }

    async fn converge_kind(&self, kind: &Kind) -> PassReport {
        let lock = self.kind_lock(kind);
        let _guard = lock.lock().await;
        let mut report = PassReport::default();

        let pending = match self.store.pending(kind).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to read pending records");
                return report;
            }
        };

        for record in pending {
            report.add(self.converge_record(&record.key()).await);
        }
        report
    }

    async fn converge_record(&self, key: &RecordKey) -> RecordOutcome {
        // Re-read under the kind lock: an overlapping pass may have
        // enacted the record since it was listed.
        let record = match self.store.get(key).await {
            Ok(Some(record)) if record.needs_enactment() => record,
            Ok(_) => return RecordOutcome::Skipped,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read record");
                return RecordOutcome::Deferred;
            }
        };

        if !self.retries.is_due(&record, Instant::now()) {
            debug!(key = %key, "Record is backing off");
            return RecordOutcome::Skipped;
        }

        let result = match Operation::plan(&record) {
            Ok(operation) => {
                debug!(key = %key, operation = operation.name(), "Enacting record");
                self.enact(key, operation).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(backend_id) => self.enacted(&record, backend_id).await,
            Err(e) => match classify(&e) {
                ErrorClass::Transient => self.deferred(&record, &e).await,
                ErrorClass::Permanent => self.failed(&record, &e).await,
            },
        }
    }

    /// Run each step of `operation` in order.
    ///
    /// Once a destroy lands the stored backend id is cleared, so a replacement
    /// whose create fails is retried as a plain create.
    async fn enact(
        &self,
        key: &RecordKey,
        operation: Operation,
    ) -> std::result::Result<Option<String>, BackendError> {
        let mut backend_id = None;
        for step in operation.into_steps() {
            let destroys = matches!(step, Operation::Destroy { .. });
            backend_id = self.execute(step).await?;
            if destroys {
                if let Err(e) = self.store.record_backend_id(key, None).await {
                    warn!(key = %key, error = %e, "Failed to clear destroyed backend id");
                }
            }
        }
        Ok(backend_id)
    }

    async fn execute(&self, operation: Operation) -> std::result::Result<Option<String>, BackendError> {
        let driver = Arc::clone(&self.driver);
        let call = tokio::task::spawn_blocking(move || operation.execute(driver.as_ref()));

        match tokio::time::timeout(self.config.backend_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BackendError::Other(format!("backend call aborted: {e}"))),
            Err(_) => Err(BackendError::Timeout),
        }
    }

    async fn enacted(&self, record: &Record, backend_id: Option<String>) -> RecordOutcome {
        let key = record.key();
        self.retries.clear(&key);

        let outcome = Outcome::Enacted {
            backend_id: backend_id.clone(),
        };
        match self.store.record_outcome(&key, record.updated_at, outcome).await {
            Ok(_) => {
                info!(key = %key, backend_id = ?backend_id, "Record enacted");
                RecordOutcome::Enacted
            }
            Err(e) => {
                // The backend state changed even though the spec moved on;
                // keep the id so the next pass replaces instead of creating.
                if backend_id != record.backend_id {
                    if let Err(e) = self.store.record_backend_id(&key, backend_id).await {
                        warn!(key = %key, error = %e, "Failed to store backend id");
                    }
                }
                self.write_failed(&key, &e)
            }
        }
    }

    async fn deferred(&self, record: &Record, error: &BackendError) -> RecordOutcome {
        let key = record.key();
        let delay = self.retries.record_failure(record, Instant::now());
        warn!(
            key = %key,
            error = %error,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Transient backend failure"
        );

        let outcome = Outcome::Deferred {
            status: error.to_string(),
        };
        match self.store.record_outcome(&key, record.updated_at, outcome).await {
            Ok(_) => RecordOutcome::Deferred,
            Err(e) => self.write_failed(&key, &e),
        }
    }

    async fn failed(&self, record: &Record, error: &BackendError) -> RecordOutcome {
        let key = record.key();
        self.retries.clear(&key);
        warn!(key = %key, error = %error, "Permanent failure, record parked until its spec changes");

        let outcome = Outcome::Failed {
            status: format!("failed: {error}"),
        };
        match self.store.record_outcome(&key, record.updated_at, outcome).await {
            Ok(_) => RecordOutcome::Failed,
            Err(e) => self.write_failed(&key, &e),
        }
    }

    fn write_failed(&self, key: &RecordKey, error: &Error) -> RecordOutcome {
        if error.is_conflict() {
            info!(key = %key, "Spec changed during enactment, record stays pending");
            RecordOutcome::Conflict
        } else {
            warn!(key = %key, error = %error, "Failed to record outcome");
            RecordOutcome::Deferred
        }
    }

    /// Run passes until `shutdown` turns true.
    ///
    /// A pass runs immediately, then whenever the interval elapses or the
    /// wake signal fires, whichever comes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "Observer loop started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.wake.notified() => {
                    debug!("Observer woken");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_pass().await {
                warn!(error = %e, "Observer pass failed");
            }
            ticker.reset();
        }

        info!("Observer loop stopped");
    }
}

/// Builder for [`Observer`].
pub struct ObserverBuilder {
    store: Option<Arc<dyn RecordStore>>,
    driver: Option<Arc<dyn BackendDriver>>,
    wake: Option<WakeSignal>,
    config: ObserverConfig,
}

impl ObserverBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            driver: None,
            wake: None,
            config: ObserverConfig::default(),
        }
    }

    /// Set the record store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the backend driver.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Share an existing wake signal.
    #[must_use]
    pub fn with_wake(mut self, wake: WakeSignal) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum sleep between passes.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Build the observer.
    pub fn build(self) -> Result<Observer> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("Record store is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| Error::invalid_config("Backend driver is required"))?;

        if self.config.interval.is_zero() {
            return Err(Error::invalid_config("observer interval must be positive"));
        }
        if self.config.backoff_base > self.config.backoff_max {
            return Err(Error::invalid_config(
                "backoff_base must not exceed backoff_max",
            ));
        }

        Ok(Observer {
            store,
            driver,
            wake: self.wake.unwrap_or_default(),
            retries: RetryTracker::new(self.config.backoff_base, self.config.backoff_max),
            config: self.config,
            kind_locks: DashMap::new(),
            passes: AtomicU64::new(0),
        })
    }
}

impl Default for ObserverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use enactor_core::Snapshot;
    use serde_json::json;

    use super::*;
    use crate::driver::InMemoryBackend;
    use crate::store::InMemoryRecordStore;

    fn kind(name: &str) -> Kind {
        Kind::new(name).unwrap()
    }

    fn spec(value: serde_json::Value) -> Snapshot {
        let serde_json::Value::Object(spec) = value else {
            unreachable!("spec must be an object");
        };
        spec
    }

    fn setup() -> (Observer, Arc<InMemoryRecordStore>, Arc<InMemoryBackend>) {
        let store = InMemoryRecordStore::new_arc();
        let backend = Arc::new(InMemoryBackend::new());
        let observer = Observer::builder()
            .with_store(store.clone())
            .with_driver(backend.clone())
            .with_config(ObserverConfig {
                backoff_base: Duration::from_secs(60),
                ..ObserverConfig::default()
            })
            .build()
            .unwrap();
        (observer, store, backend)
    }

    #[tokio::test]
    async fn test_pass_enacts_pending_record() {
        let (observer, store, backend) = setup();
        let record = store
            .create(kind("Sliver"), spec(json!({"name": "vm1"})))
            .await
            .unwrap();

        let report = observer.run_pass().await.unwrap();

        assert_eq!(report.enacted, 1);
        let stored = store.get(&record.key()).await.unwrap().unwrap();
        assert!(!stored.is_pending());
        assert_eq!(stored.backend_status, "OK");
        assert_eq!(stored.backend_id.as_deref(), Some("sliver-1"));
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_record_pending_and_backs_off() {
        let (observer, store, backend) = setup();
        let record = store.create(kind("Sliver"), Snapshot::new()).await.unwrap();
        backend.fail_next(BackendError::status(503, "busy"));

        let first = observer.run_pass().await.unwrap();
        let second = observer.run_pass().await.unwrap();

        assert_eq!(first.deferred, 1);
        assert_eq!(second.skipped, 1, "record should be backing off");
        let stored = store.get(&record.key()).await.unwrap().unwrap();
        assert!(stored.is_pending());
        assert!(stored.backend_status.contains("503"));
        assert!(stored.failed_at.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_parks_record() {
        let (observer, store, _) = setup();
        let record = store
            .create(kind("SliceRole"), spec(json!({"role": "admin", "subject": 1, "scope": "s"})))
            .await
            .unwrap();

        let first = observer.run_pass().await.unwrap();
        let second = observer.run_pass().await.unwrap();

        assert_eq!(first.failed, 1);
        assert_eq!(second.total(), 0);
        let stored = store.get(&record.key()).await.unwrap().unwrap();
        assert!(stored.backend_status.starts_with("failed: "));
        assert!(stored.is_failed());
    }

    #[tokio::test]
    async fn test_spec_change_replaces_resource() {
        let (observer, store, backend) = setup();
        let record = store
            .create(kind("Sliver"), spec(json!({"image": "a"})))
            .await
            .unwrap();
        observer.run_pass().await.unwrap();

        store
            .update_spec(&record.key(), None, spec(json!({"image": "b"})))
            .await
            .unwrap();
        observer.run_pass().await.unwrap();

        let stored = store.get(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.backend_id.as_deref(), Some("sliver-2"));
        assert_eq!(backend.resources(), vec!["sliver-2".to_string()]);
    }

    #[test]
    fn test_builder_requires_store_and_driver() {
        assert!(Observer::builder().build().is_err());
        assert!(Observer::builder()
            .with_store(InMemoryRecordStore::new_arc())
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_inverted_backoff() {
        let result = Observer::builder()
            .with_store(InMemoryRecordStore::new_arc())
            .with_driver(Arc::new(InMemoryBackend::new()))
            .with_config(ObserverConfig {
                backoff_base: Duration::from_secs(10),
                backoff_max: Duration::from_secs(1),
                ..ObserverConfig::default()
            })
            .build();

        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
