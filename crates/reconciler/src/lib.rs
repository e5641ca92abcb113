//! Observer core: keeps a declarative record store enacted on a backend.
//!
//! # Key Concepts
//!
//! ## Records
//!
//! A [`Record`] is pending while its spec has changes the backend has not
//! seen (`enacted_at` absent or older than `updated_at`). Outcome writes are
//! compare-and-swap on `updated_at`, so a spec change during a backend call
//! keeps the record pending.
//!
//! ## Observer
//!
//! The [`Observer`] runs a pass on a fixed interval or when its
//! [`WakeSignal`] fires:
//! 1. List pending records per kind
//! 2. Plan an [`Operation`] from each spec
//! 3. Run it on the [`BackendDriver`] off the async runtime, with a timeout
//! 4. Record the outcome; transient failures back off, permanent ones park
//!
//! ## Model policies
//!
//! The [`PolicyRunner`] applies cross-record rules (join records, subnet and
//! address allocation) to records changed since its previous pass.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use enactor_reconciler::{InMemoryBackend, InMemoryRecordStore, Observer};
//!
//! let store = InMemoryRecordStore::new_arc();
//! let observer = Observer::builder()
//!     .with_store(store.clone())
//!     .with_driver(Arc::new(InMemoryBackend::new()))
//!     .build()?;
//!
//! let report = observer.run_pass().await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod backoff;
pub mod deleters;
pub mod driver;
pub mod error;
pub mod observer;
pub mod operation;
pub mod policy;
pub mod record;
pub mod store;
pub mod wake;

// Re-export main types
pub use backoff::{calculate_backoff, RetryTracker};
pub use deleters::{builtin_catalog, DestroyResourceDeleter, RevokeRoleDeleter};
pub use driver::{classify, BackendCall, BackendDriver, BackendError, ErrorClass, InMemoryBackend};
pub use error::{Error, Result};
pub use observer::{Observer, ObserverBuilder, ObserverConfig, PassReport, RecordOutcome};
pub use operation::{Operation, RoleBinding};
pub use policy::{
    AddressAllocationPolicy, JoinRecordPolicy, ModelPolicy, PolicyConfig, PolicyEffect,
    PolicyReport, PolicyRunner, SubnetAllocationPolicy,
};
pub use record::{Outcome, Record, STATUS_OK};
pub use store::{InMemoryRecordStore, NotifyingRecordStore, RecordStore};
pub use wake::WakeSignal;
