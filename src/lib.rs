#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Enactor
//!
//! Observer core that keeps a declarative record store enacted against an
//! infrastructure backend.
//!
//! This library wires the workspace crates into a runnable process and
//! re-exports them for convenience.

use std::path::Path;

pub use enactor_core;
pub use enactor_events;
pub use enactor_reconciler;

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;

pub use backend::{Backend, RunningBackend, SHUTDOWN_TIMEOUT};
pub use config::EnactorConfig;
pub use error::{Error, Result};

use enactor_reconciler::{Record, RecordStore};

/// Read a JSON array of records.
pub fn load_seed(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::seed(path, e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| Error::seed(path, e.to_string()))
}

/// Write seed records as given. Returns how many were stored.
pub async fn seed_store(store: &dyn RecordStore, records: Vec<Record>) -> Result<usize> {
    let count = records.len();
    for record in records {
        store.put(record).await?;
    }
    Ok(count)
}
