//! Event plumbing for the enactor observer.
//!
//! - **Event bus**: publish and subscribe per client identity
//! - **Client identity**: persistent token naming the subscription
//! - **Deleter registry**: deletion handlers indexed by kind
//! - **Event listener**: routes deletions to deleters and wakes the observer
//!   on every other change
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use enactor_events::{DeleterRegistry, EventBus, EventListener, InMemoryEventBus};
//!
//! let bus = InMemoryEventBus::new();
//! let identity = ClientIdentity::generate();
//! let subscription = bus.subscribe(&identity).await?;
//!
//! let listener = EventListener::new(Arc::new(DeleterRegistry::builder().build()))
//!     .with_wake(wake);
//! listener.run(subscription, shutdown).await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod deleter;
pub mod error;
pub mod identity;
pub mod listener;
pub mod message;

pub use bus::{EventBus, EventSender, InMemoryEventBus, Subscription};
pub use deleter::{
    Deleter, DeleterCatalog, DeleterError, DeleterFactory, DeleterRegistry,
    DeleterRegistryBuilder, DispatchError, DispatchPolicy, DispatchReport,
};
pub use error::{Error, Result};
pub use identity::{ClientIdentity, IdentitySource, DEFAULT_IDENTITY_PATH};
pub use listener::{EventListener, ListenerOutcome, ListenerState, WakeUp};
pub use message::{decode, Decoded, EventKind, EventMessage};
