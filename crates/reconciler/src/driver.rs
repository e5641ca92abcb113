//! Backend driver seam and failure classification.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use enactor_core::{Kind, Snapshot};
use thiserror::Error;

/// Raw failure reported by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend call timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    /// HTTP-style status from the infrastructure API.
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create a status error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Classify a backend failure.
///
/// Timeouts, connection failures, rate limiting and 5xx are transient.
/// Other 4xx and invalid specs are permanent. Anything unrecognized is
/// retried.
pub fn classify(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::Status { status, .. } if *status == 429 || *status >= 500 => {
            ErrorClass::Transient
        }
        BackendError::Status { status, .. } if (400..500).contains(status) => {
            ErrorClass::Permanent
        }
        BackendError::InvalidSpec(_) => ErrorClass::Permanent,
        BackendError::Timeout
        | BackendError::Connection(_)
        | BackendError::Status { .. }
        | BackendError::Other(_) => ErrorClass::Transient,
    }
}

/// Synchronous wrapper around the infrastructure API.
///
/// Calls block; callers run them on the blocking pool.
pub trait BackendDriver: Send + Sync + 'static {
    /// Create a resource and return its backend id.
    fn create_resource(&self, kind: &Kind, spec: &Snapshot) -> Result<String, BackendError>;

    fn destroy_resource(&self, backend_id: &str) -> Result<(), BackendError>;

    fn grant_role(&self, subject: &str, scope: &str, role: &str) -> Result<(), BackendError>;

    fn revoke_role(&self, subject: &str, scope: &str, role: &str) -> Result<(), BackendError>;
}

/// A call observed by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create { kind: Kind, backend_id: String },
    Destroy { backend_id: String },
    Grant { subject: String, scope: String, role: String },
    Revoke { subject: String, scope: String, role: String },
}

#[derive(Debug, Default)]
struct BackendState {
    resources: BTreeMap<String, (Kind, Snapshot)>,
    grants: Vec<(String, String, String)>,
    calls: Vec<BackendCall>,
    failures: VecDeque<BackendError>,
}

/// In-process backend that keeps resources in memory and journals calls.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    next_id: AtomicU64,
    latency: Duration,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block every call for `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next call with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: BackendError) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push_back(error);
        }
    }

    /// Calls made so far, failed calls excluded.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Number of successful creations.
    pub fn create_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::Create { .. }))
            .count()
    }

    /// Backend ids of live resources.
    pub fn resources(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.resources.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Active role grants as `(subject, scope, role)`.
    pub fn grants(&self) -> Vec<(String, String, String)> {
        self.state.lock().map(|s| s.grants.clone()).unwrap_or_default()
    }

    fn call<T>(
        &self,
        op: impl FnOnce(&mut BackendState) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| BackendError::Other("backend state poisoned".to_string()))?;

        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        op(&mut state)
    }
}

impl BackendDriver for InMemoryBackend {
    fn create_resource(&self, kind: &Kind, spec: &Snapshot) -> Result<String, BackendError> {
        let serial = self.next_id.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.call(|state| {
            let backend_id = format!("{}-{serial}", kind.as_str().to_lowercase());
            state
                .resources
                .insert(backend_id.clone(), (kind.clone(), spec.clone()));
            state.calls.push(BackendCall::Create {
                kind: kind.clone(),
                backend_id: backend_id.clone(),
            });
            Ok(backend_id)
        })
    }

    fn destroy_resource(&self, backend_id: &str) -> Result<(), BackendError> {
        self.call(|state| {
            // Destroying an absent resource succeeds so deletes can be retried.
            state.resources.remove(backend_id);
            state.calls.push(BackendCall::Destroy {
                backend_id: backend_id.to_string(),
            });
            Ok(())
        })
    }

    fn grant_role(&self, subject: &str, scope: &str, role: &str) -> Result<(), BackendError> {
        self.call(|state| {
            let grant = (subject.to_string(), scope.to_string(), role.to_string());
            if !state.grants.contains(&grant) {
                state.grants.push(grant);
            }
            state.calls.push(BackendCall::Grant {
                subject: subject.to_string(),
                scope: scope.to_string(),
                role: role.to_string(),
            });
            Ok(())
        })
    }

    fn revoke_role(&self, subject: &str, scope: &str, role: &str) -> Result<(), BackendError> {
        self.call(|state| {
            state
                .grants
                .retain(|(s, sc, r)| !(s == subject && sc == scope && r == role));
            state.calls.push(BackendCall::Revoke {
                subject: subject.to_string(),
                scope: scope.to_string(),
                role: role.to_string(),
            });
            Ok(())
        })
    }
}
