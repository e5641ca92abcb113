//! Built-in deletion handlers backed by the driver.

use std::sync::Arc;

use async_trait::async_trait;
use enactor_core::{Kind, RecordId, Snapshot};
use enactor_events::{Deleter, DeleterCatalog, DeleterError};
use tracing::{debug, info};

use crate::driver::{BackendDriver, BackendError};
use crate::operation::RoleBinding;

/// Factory name of [`DestroyResourceDeleter`].
pub const DESTROY_RESOURCE: &str = "destroy_resource";
/// Factory name of [`RevokeRoleDeleter`].
pub const REVOKE_ROLE: &str = "revoke_role";

async fn blocking<F>(driver: &Arc<dyn BackendDriver>, call: F) -> Result<(), DeleterError>
where
    F: FnOnce(&dyn BackendDriver) -> Result<(), BackendError> + Send + 'static,
{
    let driver = Arc::clone(driver);
    tokio::task::spawn_blocking(move || call(driver.as_ref()))
        .await
        .map_err(|e| DeleterError::new(format!("backend call aborted: {e}")))?
        .map_err(|e| DeleterError::new(e.to_string()))
}

/// Destroys the backend resource named by the snapshot's `backend_id`.
pub struct DestroyResourceDeleter {
    kind: Kind,
    driver: Arc<dyn BackendDriver>,
}

impl DestroyResourceDeleter {
    pub fn new(kind: Kind, driver: Arc<dyn BackendDriver>) -> Self {
        Self { kind, driver }
    }
}

#[async_trait]
impl Deleter for DestroyResourceDeleter {
    fn kind(&self) -> &Kind {
        &self.kind
    }

    fn name(&self) -> &str {
        DESTROY_RESOURCE
    }

    async fn delete(&self, id: RecordId, snapshot: &Snapshot) -> Result<(), DeleterError> {
        let Some(backend_id) = snapshot
            .get("backend_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
        else {
            debug!(kind = %self.kind, id = %id, "Record was never created on the backend");
            return Ok(());
        };

        let target = backend_id.clone();
        blocking(&self.driver, move |driver| driver.destroy_resource(&target)).await?;
        info!(kind = %self.kind, id = %id, backend_id = %backend_id, "Destroyed backend resource");
        Ok(())
    }
}

/// Revokes the role binding described by the snapshot.
pub struct RevokeRoleDeleter {
    kind: Kind,
    driver: Arc<dyn BackendDriver>,
}

impl RevokeRoleDeleter {
    pub fn new(kind: Kind, driver: Arc<dyn BackendDriver>) -> Self {
        Self { kind, driver }
    }
}

#[async_trait]
impl Deleter for RevokeRoleDeleter {
    fn kind(&self) -> &Kind {
        &self.kind
    }

    fn name(&self) -> &str {
        REVOKE_ROLE
    }

    async fn delete(&self, id: RecordId, snapshot: &Snapshot) -> Result<(), DeleterError> {
        let binding =
            RoleBinding::from_snapshot(snapshot).map_err(|e| DeleterError::new(e.to_string()))?;

        blocking(&self.driver, {
            let binding = binding.clone();
            move |driver| driver.revoke_role(&binding.subject, &binding.scope, &binding.role)
        })
        .await?;
        info!(
            kind = %self.kind,
            id = %id,
            subject = %binding.subject,
            role = %binding.role,
            "Revoked role"
        );
        Ok(())
    }
}

/// Catalog of the built-in handler factories.
pub fn builtin_catalog(driver: &Arc<dyn BackendDriver>) -> DeleterCatalog {
    let destroy = Arc::clone(driver);
    let revoke = Arc::clone(driver);

    DeleterCatalog::new()
        .with_factory(
            DESTROY_RESOURCE,
            Arc::new(move |kind| {
                Arc::new(DestroyResourceDeleter::new(kind, Arc::clone(&destroy))) as Arc<dyn Deleter>
            }),
        )
        .with_factory(
            REVOKE_ROLE,
            Arc::new(move |kind| {
                Arc::new(RevokeRoleDeleter::new(kind, Arc::clone(&revoke))) as Arc<dyn Deleter>
            }),
        )
}
