//! Process wiring: one observer, one policy runner and one event listener
//! sharing a store, a backend driver and a bus subscription.

use std::sync::Arc;
use std::time::Duration;

use enactor_events::{
    DeleterRegistry, EventBus, EventListener, EventSender, IdentitySource, ListenerState,
};
use enactor_reconciler::{
    builtin_catalog, BackendDriver, NotifyingRecordStore, Observer, PolicyRunner, RecordStore,
    WakeSignal,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EnactorConfig;
use crate::error::Result;

/// How long shutdown waits for the loops to finish.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A configured but not yet started backend.
pub struct Backend {
    config: EnactorConfig,
    store: Arc<dyn RecordStore>,
    driver: Arc<dyn BackendDriver>,
    bus: Arc<dyn EventBus>,
}

impl Backend {
    pub fn new(
        config: EnactorConfig,
        store: Arc<dyn RecordStore>,
        driver: Arc<dyn BackendDriver>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            driver,
            bus,
        }
    }

    /// Subscribe, load deleters and spawn the loops.
    ///
    /// A failed subscription or an unreadable deleter directory is fatal;
    /// broken manifests inside the directory are only logged.
    pub async fn start(self) -> Result<RunningBackend> {
        let identity = Arc::new(
            IdentitySource::new(self.config.bus.identity_path.clone())
                .with_configured(self.config.client_id()),
        );
        let client_id = identity.identity().await;
        let subscription = self.bus.subscribe(&client_id).await?;
        info!(identity = %client_id, "Subscribed to event bus");

        let catalog = builtin_catalog(&self.driver);
        let mut registry = DeleterRegistry::builder().policy(self.config.deleters.policy);
        if let Some(dir) = &self.config.deleters.dir {
            registry = registry.scan_dir(dir, &catalog)?;
        }
        let registry = Arc::new(registry.build());

        let store: Arc<dyn RecordStore> = Arc::new(NotifyingRecordStore::new(
            Arc::clone(&self.store),
            EventSender::new(Arc::clone(&self.bus), Arc::clone(&identity)),
        ));

        let wake = WakeSignal::new();
        let observer = Arc::new(
            Observer::builder()
                .with_store(Arc::clone(&store))
                .with_driver(Arc::clone(&self.driver))
                .with_wake(wake.clone())
                .with_config(self.config.observer_config())
                .build()?,
        );
        let policies = Arc::new(
            PolicyRunner::new(Arc::clone(&store), self.config.policy_config())
                .with_builtin_policies(),
        );
        let listener = Arc::new(EventListener::new(registry).with_wake(Arc::new(wake)));
        let listener_state = listener.state();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            {
                let observer = Arc::clone(&observer);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { observer.run(shutdown).await })
            },
            {
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { policies.run(shutdown).await })
            },
            {
                let listener = Arc::clone(&listener);
                tokio::spawn(async move { listener.run(subscription, shutdown_rx).await })
            },
        ];

        info!(
            interval_secs = self.config.observer.interval.as_secs(),
            policies = self.config.policy.enabled,
            "Backend started"
        );

        Ok(RunningBackend {
            store,
            observer,
            listener_state,
            shutdown_tx,
            tasks,
        })
    }
}

/// Handle to the running loops.
pub struct RunningBackend {
    store: Arc<dyn RecordStore>,
    observer: Arc<Observer>,
    listener_state: watch::Receiver<ListenerState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningBackend {
    /// Store whose writes notify the bus. Use this for writes that the
    /// observer should see promptly.
    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn observer(&self) -> Arc<Observer> {
        Arc::clone(&self.observer)
    }

    pub fn listener_state(&self) -> watch::Receiver<ListenerState> {
        self.listener_state.clone()
    }

    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(self) {
        info!("Shutting down backend");
        // Receivers only disappear once every loop has exited.
        let _ = self.shutdown_tx.send(true);

        let tasks = self.tasks;
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(tasks)).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Backend task ended abnormally");
                    }
                }
                info!("Backend stopped");
            }
            Err(_) => {
                warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Backend tasks did not stop in time, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}
