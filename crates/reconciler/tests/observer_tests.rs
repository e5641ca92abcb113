//! Observer behavior end to end against the in-memory store and backend.
//!
//! These tests validate that:
//! - Repeated passes over a converged store do nothing
//! - Concurrent passes and wake storms never create a resource twice
//! - Any number of wakes during a pass yields at most one extra pass
//! - A spec change during a backend call keeps the record pending
//! - A new sliver is created and marked enacted
//! - A replacement whose create fails transiently is retried as a create

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use enactor_core::{Kind, Snapshot};
use enactor_reconciler::{
    BackendDriver, BackendError, InMemoryBackend, InMemoryRecordStore, Observer, ObserverConfig,
    Record, RecordStore,
};
use serde_json::{json, Value};
use tokio::sync::watch;

// ==========================================================================
// TEST HELPERS
// ==========================================================================

fn kind(name: &str) -> Result<Kind, String> {
    Kind::new(name).map_err(|e| e.to_string())
}

fn spec(value: Value) -> Snapshot {
    match value {
        Value::Object(map) => map,
        _ => Snapshot::new(),
    }
}

fn observer(
    store: &Arc<InMemoryRecordStore>,
    backend: &Arc<InMemoryBackend>,
    interval: Duration,
) -> Result<Arc<Observer>, String> {
    Observer::builder()
        .with_store(store.clone())
        .with_driver(backend.clone())
        .with_config(ObserverConfig {
            interval,
            ..ObserverConfig::default()
        })
        .build()
        .map(Arc::new)
        .map_err(|e| e.to_string())
}

async fn fetch(store: &InMemoryRecordStore, record: &Record) -> Result<Record, String> {
    store
        .get(&record.key())
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("{} disappeared", record.key()))
}

/// Backend that rejects destroys of unknown ids with 404, like a real API,
/// and answers 503 to the create numbered `failing_create`.
struct StrictBackend {
    live: Mutex<Vec<String>>,
    creates: AtomicUsize,
    failing_create: usize,
}

impl StrictBackend {
    fn failing_create(n: usize) -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            creates: AtomicUsize::new(0),
            failing_create: n,
        }
    }

    fn live(&self) -> Vec<String> {
        self.live.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl BackendDriver for StrictBackend {
    fn create_resource(&self, _kind: &Kind, _spec: &Snapshot) -> Result<String, BackendError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.failing_create {
            return Err(BackendError::status(503, "unavailable"));
        }
        let id = format!("r-{n}");
        let mut live = self
            .live
            .lock()
            .map_err(|_| BackendError::Other("poisoned".into()))?;
        live.push(id.clone());
        Ok(id)
    }

    fn destroy_resource(&self, backend_id: &str) -> Result<(), BackendError> {
        let mut live = self
            .live
            .lock()
            .map_err(|_| BackendError::Other("poisoned".into()))?;
        let before = live.len();
        live.retain(|id| id != backend_id);
        if live.len() == before {
            return Err(BackendError::status(404, "no such resource"));
        }
        Ok(())
    }

    fn grant_role(&self, _subject: &str, _scope: &str, _role: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn revoke_role(&self, _subject: &str, _scope: &str, _role: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

// ==========================================================================
// BEHAVIORAL TESTS
// ==========================================================================

#[tokio::test]
async fn should_create_new_sliver_and_mark_it_enacted() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(InMemoryBackend::new());
    let observer = observer(&store, &backend, Duration::from_secs(3600))?;
    let sliver = store
        .create(kind("Sliver")?, spec(json!({"name": "vm1", "image": "ubuntu"})))
        .await
        .map_err(|e| e.to_string())?;

    let report = observer.run_pass().await.map_err(|e| e.to_string())?;

    assert_eq!(report.enacted, 1);
    let stored = fetch(&store, &sliver).await?;
    assert!(stored.enacted_at.is_some_and(|at| at >= stored.updated_at));
    assert_eq!(stored.backend_status, "OK");
    assert_eq!(backend.create_count(), 1);
    Ok(())
}

#[tokio::test]
async fn should_do_nothing_on_repeated_passes_once_converged() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(InMemoryBackend::new());
    let observer = observer(&store, &backend, Duration::from_secs(3600))?;
    for name in ["a", "b", "c"] {
        store
            .create(kind("Sliver")?, spec(json!({ "name": name })))
            .await
            .map_err(|e| e.to_string())?;
    }
    store
        .create(kind("Network")?, spec(json!({"name": "private"})))
        .await
        .map_err(|e| e.to_string())?;

    let first = observer.run_pass().await.map_err(|e| e.to_string())?;
    let calls_after_first = backend.calls().len();
    let second = observer.run_pass().await.map_err(|e| e.to_string())?;
    let third = observer.run_pass().await.map_err(|e| e.to_string())?;

    assert_eq!(first.enacted, 4);
    assert_eq!(second.total(), 0);
    assert_eq!(third.total(), 0);
    assert_eq!(backend.calls().len(), calls_after_first);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_create_at_most_once_under_concurrent_passes() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(50)));
    let observer = observer(&store, &backend, Duration::from_secs(3600))?;
    store
        .create(kind("Sliver")?, spec(json!({"name": "vm1"})))
        .await
        .map_err(|e| e.to_string())?;

    let passes: Vec<_> = (0..8)
        .map(|_| {
            let observer = Arc::clone(&observer);
            tokio::spawn(async move { observer.run_pass().await })
        })
        .collect();
    let mut enacted = 0;
    for pass in passes {
        let report = pass
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        enacted += report.enacted;
    }

    assert_eq!(enacted, 1);
    assert_eq!(backend.create_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_create_at_most_once_under_wake_storm() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(20)));
    let observer = observer(&store, &backend, Duration::from_secs(3600))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let observer = Arc::clone(&observer);
        tokio::spawn(async move { observer.run(shutdown_rx).await })
    };

    let sliver = store
        .create(kind("Sliver")?, spec(json!({"name": "vm1"})))
        .await
        .map_err(|e| e.to_string())?;
    let wake = observer.wake_signal();
    for _ in 0..500 {
        wake.wake();
        tokio::task::yield_now().await;
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if fetch(&store, &sliver).await.is_ok_and(|r| !r.is_pending()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| "sliver never converged".to_string())?;

    shutdown_tx.send(true).map_err(|e| e.to_string())?;
    task.await.map_err(|e| e.to_string())?;
    assert_eq!(backend.create_count(), 1);
    Ok(())
}

#[tokio::test]
async fn should_coalesce_wakes_into_at_most_one_extra_pass() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(InMemoryBackend::new());
    let observer = observer(&store, &backend, Duration::from_secs(3600))?;

    let wake = observer.wake_signal();
    for _ in 0..100 {
        wake.wake();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let observer = Arc::clone(&observer);
        tokio::spawn(async move { observer.run(shutdown_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_storm = observer.passes();

    wake.wake();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_single = observer.passes();

    shutdown_tx.send(true).map_err(|e| e.to_string())?;
    task.await.map_err(|e| e.to_string())?;

    // One pass on start, at most one for the stored wake.
    assert!((1..=2).contains(&after_storm), "got {after_storm} passes");
    assert_eq!(after_single, after_storm + 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn should_keep_record_pending_when_spec_changes_mid_call() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(200)));
    let observer = observer(&store, &backend, Duration::from_secs(3600))?;
    let sliver = store
        .create(kind("Sliver")?, spec(json!({"image": "a"})))
        .await
        .map_err(|e| e.to_string())?;

    let pass = {
        let observer = Arc::clone(&observer);
        tokio::spawn(async move { observer.run_pass().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .update_spec(&sliver.key(), None, spec(json!({"image": "b"})))
        .await
        .map_err(|e| e.to_string())?;

    let report = pass
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    assert_eq!(report.conflicts, 1);
    let stored = fetch(&store, &sliver).await?;
    assert!(stored.is_pending());
    assert!(stored.backend_id.is_some(), "created resource must not be forgotten");

    // The next pass replaces the resource built from the stale spec.
    let report = observer.run_pass().await.map_err(|e| e.to_string())?;
    assert_eq!(report.enacted, 1);
    assert_eq!(backend.create_count(), 2);
    assert_eq!(backend.resources().len(), 1);
    Ok(())
}

#[tokio::test]
async fn should_retry_failed_replacement_as_create() -> Result<(), String> {
    let store = InMemoryRecordStore::new_arc();
    let backend = Arc::new(StrictBackend::failing_create(2));
    let observer = Observer::builder()
        .with_store(store.clone())
        .with_driver(backend.clone())
        .with_config(ObserverConfig {
            interval: Duration::from_secs(3600),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(1),
            ..ObserverConfig::default()
        })
        .build()
        .map_err(|e| e.to_string())?;
    let sliver = store
        .create(kind("Sliver")?, spec(json!({"image": "a"})))
        .await
        .map_err(|e| e.to_string())?;
    observer.run_pass().await.map_err(|e| e.to_string())?;

    store
        .update_spec(&sliver.key(), None, spec(json!({"image": "b"})))
        .await
        .map_err(|e| e.to_string())?;
    let replace = observer.run_pass().await.map_err(|e| e.to_string())?;

    assert_eq!(replace.deferred, 1);
    let stored = fetch(&store, &sliver).await?;
    assert!(stored.is_pending());
    assert_eq!(stored.backend_id, None, "destroyed resource must be forgotten");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let retry = observer.run_pass().await.map_err(|e| e.to_string())?;

    assert_eq!(retry.enacted, 1);
    assert_eq!(retry.failed, 0);
    let stored = fetch(&store, &sliver).await?;
    assert!(!stored.is_failed());
    assert_eq!(stored.backend_status, "OK");
    assert_eq!(stored.backend_id.as_deref(), Some("r-3"));
    assert_eq!(backend.live(), vec!["r-3".to_string()]);
    Ok(())
}
