//! Deletion handler registry.
//!
//! Handlers are registered per kind, either directly at startup or by
//! scanning a directory of plugin manifests:
//!
//! ```toml
//! # /etc/enactor/deleters/compute.toml
//! [[deleter]]
//! kind = "Sliver"
//! handler = "destroy_resource"
//! ```
//!
//! A manifest entry names a handler factory from the compiled-in
//! [`DeleterCatalog`]. Registration order is discovery order: manifests in
//! file-name order, entries in file order.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use enactor_core::{Kind, RecordId, RecordKey, Snapshot};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Failure reported by a single deletion handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct DeleterError {
    reason: String,
}

impl DeleterError {
    /// Create a handler failure.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Post-deletion cleanup for one resource kind.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// Kind this handler is bound to.
    fn kind(&self) -> &Kind;

    /// Stable handler name, unique within a kind.
    fn name(&self) -> &str;

    /// Clean up after the record `id`, given its final snapshot.
    async fn delete(&self, id: RecordId, snapshot: &Snapshot) -> std::result::Result<(), DeleterError>;
}

/// Builds a handler bound to a kind.
pub type DeleterFactory = Arc<dyn Fn(Kind) -> Arc<dyn Deleter> + Send + Sync>;

/// Named handler factories that plugin manifests may reference.
#[derive(Clone, Default)]
pub struct DeleterCatalog {
    factories: BTreeMap<String, DeleterFactory>,
}

impl DeleterCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory under `name`.
    #[must_use]
    pub fn with_factory(mut self, name: impl Into<String>, factory: DeleterFactory) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Build a handler for `kind` from the factory called `name`.
    pub fn instantiate(&self, name: &str, kind: Kind) -> Option<Arc<dyn Deleter>> {
        self.factories.get(name).map(|factory| factory(kind))
    }

    /// Names of all factories, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for DeleterCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleterCatalog")
            .field("factories", &self.names())
            .finish()
    }
}

/// What to do with the remaining handlers of an event once one fails.
///
/// `AbortOnFirstFailure` is the historical behavior and stays the default;
/// `RunAll` is the alternative under review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    #[default]
    AbortOnFirstFailure,
    RunAll,
}

/// Which handlers ran for one deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub key: RecordKey,
    /// Handlers that completed successfully, in order.
    pub ran: Vec<String>,
    /// Handlers that failed, with their error.
    pub failed: Vec<(String, String)>,
    /// Handlers never invoked because an earlier one failed.
    pub skipped: Vec<String>,
}

impl DispatchReport {
    fn new(key: RecordKey) -> Self {
        Self {
            key,
            ran: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// True when every registered handler ran successfully.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Deletion dispatch finished with at least one handler failure.
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub report: Box<DispatchReport>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deletion handlers for {} failed ({})",
            self.report.key,
            self.report.failure_summary()
        )?;
        if !self.report.skipped.is_empty() {
            write!(f, ", skipped {}", self.report.skipped.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for DispatchError {}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    deleter: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(default)]
    kind: Option<String>,
    handler: String,
}

/// Immutable kind → handlers table.
pub struct DeleterRegistry {
    handlers: BTreeMap<Kind, Vec<Arc<dyn Deleter>>>,
    policy: DispatchPolicy,
    load_errors: Vec<String>,
}

impl DeleterRegistry {
    /// Start building a registry.
    pub fn builder() -> DeleterRegistryBuilder {
        DeleterRegistryBuilder::new()
    }

    /// Scan `dir` once and build a registry from it.
    pub fn load_handlers(dir: &Path, catalog: &DeleterCatalog) -> Result<Self> {
        Ok(Self::builder().scan_dir(dir, catalog)?.build())
    }

    /// Handler names per kind, in registration order.
    pub fn entries(&self) -> Vec<(Kind, Vec<String>)> {
        self.handlers
            .iter()
            .map(|(kind, handlers)| {
                (
                    kind.clone(),
                    handlers.iter().map(|h| h.name().to_string()).collect(),
                )
            })
            .collect()
    }

    /// Handler names registered for `kind`.
    pub fn handlers_for(&self, kind: &Kind) -> Vec<String> {
        self.handlers
            .get(kind)
            .map(|handlers| handlers.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Manifests or entries skipped while loading.
    pub fn load_errors(&self) -> &[String] {
        &self.load_errors
    }

    /// Active dispatch policy.
    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Run every handler registered for `kind`, in registration order.
    pub async fn dispatch_delete(
        &self,
        kind: &Kind,
        id: RecordId,
        snapshot: &Snapshot,
    ) -> std::result::Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::new(RecordKey::new(kind.clone(), id));

        let Some(handlers) = self.handlers.get(kind).filter(|h| !h.is_empty()) else {
            warn!(
                kind = %kind,
                id = %id,
                "No deleters registered for kind, deletion cleanup is a no-op"
            );
            return Ok(report);
        };

        for (position, handler) in handlers.iter().enumerate() {
            debug!(kind = %kind, id = %id, handler = handler.name(), "Running deleter");

            // A panicking handler counts as a failed one.
            let outcome = AssertUnwindSafe(handler.delete(id, snapshot))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(DeleterError::new(format!(
                        "handler panicked: {}",
                        panic_message(&*panic)
                    )))
                });

            match outcome {
                Ok(()) => report.ran.push(handler.name().to_string()),
                Err(e) => {
                    report
                        .failed
                        .push((handler.name().to_string(), e.to_string()));

                    if self.policy == DispatchPolicy::AbortOnFirstFailure {
                        report.skipped = handlers
                            .iter()
                            .skip(position.saturating_add(1))
                            .map(|h| h.name().to_string())
                            .collect();
                        break;
                    }
                }
            }
        }

        if report.failed.is_empty() {
            Ok(report)
        } else {
            error!(
                kind = %kind,
                id = %id,
                ran = ?report.ran,
                failed = ?report.failed,
                skipped = ?report.skipped,
                "Deletion handlers failed"
            );
            Err(DispatchError {
                report: Box::new(report),
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

impl fmt::Debug for DeleterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleterRegistry")
            .field("handlers", &self.entries())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Builder for [`DeleterRegistry`].
pub struct DeleterRegistryBuilder {
    handlers: BTreeMap<Kind, Vec<Arc<dyn Deleter>>>,
    policy: DispatchPolicy,
    load_errors: Vec<String>,
}

impl DeleterRegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            policy: DispatchPolicy::default(),
            load_errors: Vec::new(),
        }
    }

    /// Set the dispatch policy.
    #[must_use]
    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a handler; an exact `(kind, name)` duplicate is skipped.
    #[must_use]
    pub fn register(mut self, handler: Arc<dyn Deleter>) -> Self {
        self.insert(handler);
        self
    }

    fn insert(&mut self, handler: Arc<dyn Deleter>) -> bool {
        let entry = self.handlers.entry(handler.kind().clone()).or_default();
        if entry.iter().any(|h| h.name() == handler.name()) {
            debug!(kind = %handler.kind(), handler = handler.name(), "Deleter already registered");
            return false;
        }
        entry.push(handler);
        true
    }

    /// Register every manifest entry found in `dir`.
    ///
    /// Fails only when the directory itself cannot be read; broken manifests
    /// and unknown handlers are logged and skipped.
    pub fn scan_dir(mut self, dir: &Path, catalog: &DeleterCatalog) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::plugin_directory(dir, e.to_string()))?;

        let mut manifests: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        manifests.sort();

        for path in manifests {
            if let Err(e) = self.load_manifest(&path, catalog) {
                warn!(error = %e, "Skipping deleter plugin");
                self.load_errors.push(e.to_string());
            }
        }

        info!(
            dir = %dir.display(),
            kinds = ?self.handlers.keys().map(Kind::as_str).collect::<Vec<_>>(),
            "Loaded deleters"
        );
        Ok(self)
    }

    fn load_manifest(&mut self, path: &Path, catalog: &DeleterCatalog) -> Result<()> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::plugin_load(path, e.to_string()))?;
        let manifest: Manifest =
            toml::from_str(&contents).map_err(|e| Error::plugin_load(path, e.to_string()))?;

        for entry in manifest.deleter {
            // Entries without a kind are abstract and never registered.
            let Some(kind) = entry.kind.and_then(|k| Kind::new(k).ok()) else {
                debug!(path = %path.display(), handler = %entry.handler, "Deleter entry without kind");
                continue;
            };

            match catalog.instantiate(&entry.handler, kind.clone()) {
                Some(handler) => {
                    self.insert(handler);
                }
                None => {
                    let err = Error::plugin_load(
                        path,
                        format!("unknown deleter handler '{}' for kind {kind}", entry.handler),
                    );
                    warn!(error = %err, "Skipping deleter entry");
                    self.load_errors.push(err.to_string());
                }
            }
        }
        Ok(())
    }

    /// Freeze the registry.
    pub fn build(self) -> DeleterRegistry {
        DeleterRegistry {
            handlers: self.handlers,
            policy: self.policy,
            load_errors: self.load_errors,
        }
    }
}

impl Default for DeleterRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
