//! Planning backend operations from a record's spec.

use enactor_core::{Kind, Snapshot};
use serde_json::Value;

use crate::driver::{BackendDriver, BackendError};
use crate::record::Record;

/// Subject, scope and role of a role binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub subject: String,
    pub scope: String,
    pub role: String,
}

impl RoleBinding {
    /// Read a binding from a spec or snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, BackendError> {
        let field = |name: &str| {
            snapshot
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| BackendError::InvalidSpec(format!("{name} must be a string")))
        };

        Ok(Self {
            subject: field("subject")?,
            scope: field("scope")?,
            role: field("role")?,
        })
    }
}

/// What the backend must do to converge one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create { kind: Kind, spec: Snapshot },
    /// Destroy the old resource, then create from the new spec.
    Replace {
        backend_id: String,
        kind: Kind,
        spec: Snapshot,
    },
    Destroy { backend_id: String },
    GrantRole(RoleBinding),
    RevokeRole(RoleBinding),
    /// Nothing to do on the backend.
    Noop,
}

impl Operation {
    /// Plan the operation for a pending record.
    ///
    /// An unusable spec is reported as [`BackendError::InvalidSpec`], which
    /// classifies as permanent.
    pub fn plan(record: &Record) -> Result<Self, BackendError> {
        let spec = &record.spec;

        if spec.contains_key("role") {
            let binding = RoleBinding::from_snapshot(spec)?;
            return Ok(if flag(spec, "revoked") == Some(true) {
                Self::RevokeRole(binding)
            } else {
                Self::GrantRole(binding)
            });
        }

        if flag(spec, "enabled") == Some(false) {
            return Ok(record
                .backend_id
                .clone()
                .map_or(Self::Noop, |backend_id| Self::Destroy { backend_id }));
        }

        Ok(match &record.backend_id {
            None => Self::Create {
                kind: record.kind.clone(),
                spec: spec.clone(),
            },
            Some(backend_id) => Self::Replace {
                backend_id: backend_id.clone(),
                kind: record.kind.clone(),
                spec: spec.clone(),
            },
        })
    }

    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Replace { .. } => "replace",
            Self::Destroy { .. } => "destroy",
            Self::GrantRole(_) => "grant_role",
            Self::RevokeRole(_) => "revoke_role",
            Self::Noop => "noop",
        }
    }

    /// Split into backend calls that can each be recorded on their own.
    ///
    /// A replacement becomes a destroy followed by a create.
    pub fn into_steps(self) -> Vec<Self> {
        match self {
            Self::Replace {
                backend_id,
                kind,
                spec,
            } => vec![Self::Destroy { backend_id }, Self::Create { kind, spec }],
            other => vec![other],
        }
    }

    /// Run against the driver, returning the backend id the record should hold.
    pub fn execute(&self, driver: &dyn BackendDriver) -> Result<Option<String>, BackendError> {
        match self {
            Self::Create { kind, spec } => driver.create_resource(kind, spec).map(Some),
            Self::Replace {
                backend_id,
                kind,
                spec,
            } => {
                driver.destroy_resource(backend_id)?;
                driver.create_resource(kind, spec).map(Some)
            }
            Self::Destroy { backend_id } => driver.destroy_resource(backend_id).map(|()| None),
            Self::GrantRole(b) => driver.grant_role(&b.subject, &b.scope, &b.role).map(|()| None),
            Self::RevokeRole(b) => driver
                .revoke_role(&b.subject, &b.scope, &b.role)
                .map(|()| None),
            Self::Noop => Ok(None),
        }
    }
}

fn flag(spec: &Snapshot, name: &str) -> Option<bool> {
    spec.get(name).and_then(Value::as_bool)
}
