//! Event bus client for pub/sub between record writers and the observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use enactor_core::{Kind, RecordId, Snapshot};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{ClientIdentity, IdentitySource};
use crate::message::EventMessage;

/// Default per-identity channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Trait for pub/sub transports.
///
/// Messages are routed by client identity: a listener receives what was
/// published under its own identity. Delivery is at-least-once.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an already encoded payload.
    async fn publish_raw(&self, identity: &ClientIdentity, payload: String) -> Result<()>;

    /// Open a subscription for an identity.
    async fn subscribe(&self, identity: &ClientIdentity) -> Result<Subscription>;

    /// Encode and publish a message.
    async fn publish(&self, identity: &ClientIdentity, message: &EventMessage) -> Result<()> {
        let payload = message.encode()?;
        self.publish_raw(identity, payload).await
    }
}

/// Subscription handle for receiving raw payloads.
pub struct Subscription {
    identity: ClientIdentity,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    pub fn new(identity: ClientIdentity, receiver: broadcast::Receiver<String>) -> Self {
        Self { identity, receiver }
    }

    /// Receive the next payload.
    ///
    /// Messages lost to lag are logged and skipped; only a closed channel
    /// ends the subscription.
    pub async fn recv(&mut self) -> Result<String> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        identity = %self.identity,
                        skipped,
                        "Subscriber lagged, messages were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Try to receive a payload without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Identity this subscription listens on.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }
}

/// In-process bus with one broadcast channel per client identity.
pub struct InMemoryEventBus {
    channels: DashMap<ClientIdentity, broadcast::Sender<String>>,
    capacity: usize,
    published: AtomicU64,
}

impl InMemoryEventBus {
    /// Create a bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with the given per-identity channel capacity.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// Number of messages successfully published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn channel(&self, identity: &ClientIdentity) -> broadcast::Sender<String> {
        self.channels
            .entry(identity.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .value()
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish_raw(&self, identity: &ClientIdentity, payload: String) -> Result<()> {
        let sender = self.channel(identity);
        let receivers = sender
            .send(payload)
            .map_err(|_| Error::publish_failed(identity.as_str(), "no active subscribers"))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(identity = %identity, receivers, "Published event");
        Ok(())
    }

    async fn subscribe(&self, identity: &ClientIdentity) -> Result<Subscription> {
        let receiver = self.channel(identity).subscribe();
        debug!(identity = %identity, "Subscribed to event bus");
        Ok(Subscription::new(identity.clone(), receiver))
    }
}

/// Publishes record events under this process's client identity.
#[derive(Clone)]
pub struct EventSender {
    bus: Arc<dyn EventBus>,
    identity: Arc<IdentitySource>,
}

impl EventSender {
    /// Create a sender.
    pub fn new(bus: Arc<dyn EventBus>, identity: Arc<IdentitySource>) -> Self {
        Self { bus, identity }
    }

    /// Publish an event about one record, returning the stamped message id.
    pub async fn fire(
        &self,
        kind: Kind,
        id: RecordId,
        delete_flag: bool,
        snapshot: Snapshot,
    ) -> Result<Uuid> {
        let message = if delete_flag {
            EventMessage::deletion(kind, id, snapshot)
        } else {
            EventMessage::change(kind, id, snapshot)
        };
        let uuid = message.uuid.unwrap_or_else(Uuid::new_v4);

        let identity = self.identity.identity().await;
        self.bus.publish(&identity, &message).await?;
        Ok(uuid)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::{decode, Decoded};

    fn identity(token: &str) -> ClientIdentity {
        ClientIdentity::new(token).unwrap()
    }

    #[tokio::test]
    async fn should_deliver_to_subscriber_of_same_identity() {
        let bus = InMemoryEventBus::new();
        let id = identity("observer");
        let mut sub = bus.subscribe(&id).await.unwrap();

        bus.publish_raw(&id, "{}".to_string()).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), "{}");
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn should_not_deliver_across_identities() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(&identity("a")).await.unwrap();
        let _other = bus.subscribe(&identity("b")).await.unwrap();

        bus.publish_raw(&identity("b"), "{}".to_string())
            .await
            .unwrap();

        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn should_report_publish_without_subscribers() {
        let bus = InMemoryEventBus::new();

        let result = bus.publish_raw(&identity("nobody"), "{}".to_string()).await;

        assert!(matches!(result, Err(Error::PublishFailed { .. })));
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn should_skip_lagged_messages_and_keep_receiving() {
        let bus = InMemoryEventBus::with_channel_capacity(2);
        let id = identity("slow");
        let mut sub = bus.subscribe(&id).await.unwrap();

        for n in 0..5 {
            bus.publish_raw(&id, n.to_string()).await.unwrap();
        }

        // Oldest messages were overwritten; the newest two survive.
        assert_eq!(sub.recv().await.unwrap(), "3");
        assert_eq!(sub.recv().await.unwrap(), "4");
    }

    #[tokio::test]
    async fn should_fire_encoded_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            IdentitySource::new(dir.path().join("id")).with_configured(ClientIdentity::new("me")),
        );
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe(&identity("me")).await.unwrap();
        let sender = EventSender::new(bus.clone(), source);

        let mut snapshot = Snapshot::new();
        snapshot.insert("name".into(), "vm1".into());
        let uuid = sender
            .fire(Kind::new("Sliver").unwrap(), RecordId::new(42), true, snapshot)
            .await
            .unwrap();

        let payload = sub.recv().await.unwrap();
        let Ok(Decoded::Deletion(message)) = decode(&payload) else {
            unreachable!("expected deletion payload, got {payload}");
        };
        assert_eq!(message.uuid, Some(uuid));
        assert_eq!(message.id, RecordId::new(42));
    }
}
