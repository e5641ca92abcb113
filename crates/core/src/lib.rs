//! Core types, errors, and utilities for enactor.
//!
//! Every other crate in the workspace addresses records through the
//! identifiers defined here: a [`Kind`] tag, a [`RecordId`] within that kind,
//! and the JSON [`Snapshot`] of a record's attributes.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod result;
pub mod types;

pub use error::Error;
pub use result::{Result, ResultExt};
pub use types::{Kind, RecordId, RecordKey, Snapshot};
