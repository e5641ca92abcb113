//! Event listener: routes bus messages to deleters or wakes the observer.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::Subscription;
use crate::deleter::{DeleterRegistry, DispatchReport};
use crate::error::Error;
use crate::message::{decode, Decoded, EventMessage};

/// Deletion uuids remembered for duplicate suppression.
const SEEN_CAPACITY: u64 = 10_000;

/// How long a handled deletion uuid is remembered.
const SEEN_TTL: Duration = Duration::from_secs(600);

/// Non-blocking, coalescing wake signal towards the observer.
pub trait WakeUp: Send + Sync {
    fn wake_up(&self);
}

impl WakeUp for Notify {
    fn wake_up(&self) {
        self.notify_one();
    }
}

/// Where the listener is in handling the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Decoding,
    Dispatching,
    Signaling,
    Stopped,
}

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// The payload was not a JSON object.
    Dropped,
    /// The deletion was already handled.
    Duplicate,
    /// All deleters for the kind ran.
    Dispatched(DispatchReport),
    /// A deleter failed; the failure was logged.
    DispatchFailed(DispatchReport),
    /// The observer was woken.
    Signaled,
}

/// Consumes bus messages for one client identity.
pub struct EventListener {
    registry: Arc<DeleterRegistry>,
    wake: Option<Arc<dyn WakeUp>>,
    seen: Cache<Uuid, ()>,
    state: watch::Sender<ListenerState>,
}

impl EventListener {
    /// Create a listener dispatching into `registry`.
    pub fn new(registry: Arc<DeleterRegistry>) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            registry,
            wake: None,
            seen: Cache::builder()
                .max_capacity(SEEN_CAPACITY)
                .time_to_live(SEEN_TTL)
                .build(),
            state,
        }
    }

    /// Wake `target` on every non-deletion event.
    #[must_use]
    pub fn with_wake(mut self, target: Arc<dyn WakeUp>) -> Self {
        self.wake = Some(target);
        self
    }

    /// Watch the listener state.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    /// Handle one raw payload.
    pub async fn handle_event(&self, payload: &str) -> ListenerOutcome {
        self.set_state(ListenerState::Decoding);

        let outcome = match decode(payload) {
            Err(e) => {
                warn!(error = %e, "Dropping undecodable event");
                ListenerOutcome::Dropped
            }
            Ok(Decoded::Deletion(message)) => self.dispatch(message).await,
            Ok(Decoded::MalformedDeletion { reason }) => {
                warn!(reason = %reason, "Deletion event is malformed, treating as change");
                self.signal()
            }
            Ok(Decoded::Change(_)) => self.signal(),
        };

        self.set_state(ListenerState::Idle);
        outcome
    }

    async fn dispatch(&self, message: EventMessage) -> ListenerOutcome {
        if let Some(uuid) = message.uuid {
            if self.seen.contains_key(&uuid) {
                debug!(uuid = %uuid, key = %message.key(), "Skipping duplicate deletion");
                return ListenerOutcome::Duplicate;
            }
        }

        self.set_state(ListenerState::Dispatching);
        match self
            .registry
            .dispatch_delete(&message.kind, message.id, &message.snapshot)
            .await
        {
            Ok(report) => {
                if let Some(uuid) = message.uuid {
                    self.seen.insert(uuid, ());
                }
                debug!(key = %report.key, ran = ?report.ran, "Deletion dispatched");
                ListenerOutcome::Dispatched(report)
            }
            Err(e) => {
                error!(error = %e, "Deletion dispatch failed");
                ListenerOutcome::DispatchFailed(*e.report)
            }
        }
    }

    fn signal(&self) -> ListenerOutcome {
        self.set_state(ListenerState::Signaling);
        if let Some(wake) = &self.wake {
            wake.wake_up();
        }
        ListenerOutcome::Signaled
    }

    /// Receive and handle messages until shutdown or the bus closes.
    pub async fn run(&self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!(identity = %subscription.identity(), "Event listener started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event listener shutting down");
                        break;
                    }
                }
                received = subscription.recv() => match received {
                    Ok(payload) => {
                        self.handle_event(&payload).await;
                    }
                    Err(Error::ChannelClosed) => {
                        warn!("Event bus closed, listener stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Event receive failed");
                    }
                }
            }
        }

        self.set_state(ListenerState::Stopped);
    }
}
