//! Persistent client identity for bus subscriptions.
//!
//! The identity is resolved once per [`IdentitySource`]: a configured id wins,
//! otherwise the first line of the identity file is reused, otherwise a new
//! random id is generated and written back so the next start resumes the
//! same subscription.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Default location of the persisted identity.
pub const DEFAULT_IDENTITY_PATH: &str = "/opt/enactor/random_client_id";

/// Number of random bytes in a generated identity.
const IDENTITY_BYTES: usize = 12;

/// Opaque client token naming a logical bus subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wrap an existing token. Returns `None` for blank tokens.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let token = token.trim();
        (!token.is_empty()).then(|| Self(token.to_string()))
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut bytes = [0u8; IDENTITY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE.encode(bytes))
    }

    /// Get the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lazily resolved, process-stable client identity.
#[derive(Debug)]
pub struct IdentitySource {
    configured: Option<ClientIdentity>,
    path: PathBuf,
    resolved: OnceCell<ClientIdentity>,
}

impl IdentitySource {
    /// Create a source persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            configured: None,
            path: path.into(),
            resolved: OnceCell::new(),
        }
    }

    /// Use a configured identity instead of the persisted one.
    #[must_use]
    pub fn with_configured(mut self, identity: Option<ClientIdentity>) -> Self {
        self.configured = identity;
        self
    }

    /// Path of the identity file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the identity, at most once per source.
    pub async fn identity(&self) -> ClientIdentity {
        self.resolved
            .get_or_init(|| self.resolve())
            .await
            .clone()
    }

    async fn resolve(&self) -> ClientIdentity {
        if let Some(configured) = &self.configured {
            return configured.clone();
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                if let Some(identity) = contents.lines().next().and_then(ClientIdentity::new) {
                    info!(path = %self.path.display(), identity = %identity, "Loaded client identity");
                    return identity;
                }
                warn!(path = %self.path.display(), "Client identity file is empty");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read client identity");
            }
        }

        let identity = ClientIdentity::generate();
        info!(identity = %identity, "Generated new client identity");

        // Another process may race on this write; the last writer wins.
        if let Err(e) = persist(&self.path, &identity).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist client identity");
        }

        identity
    }
}

async fn persist(path: &Path, identity: &ClientIdentity) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, format!("{identity}\n")).await
}
