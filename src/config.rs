//! Configuration for the enactor process.
//!
//! Loaded from TOML (or JSON, by extension), then overridden from `ENACTOR_*`
//! environment variables, then by CLI flags.
//!
//! ```toml
//! log_level = "info"
//!
//! [observer]
//! interval = 10          # seconds
//! backend_timeout = 30   # seconds
//! backoff_base_ms = 1000
//! backoff_max = 300      # seconds
//!
//! [policy]
//! enabled = true
//! interval = 5
//!
//! [bus]
//! identity_path = "/opt/enactor/random_client_id"
//!
//! [deleters]
//! dir = "/etc/enactor/deleters"
//! policy = "abort_on_first_failure"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use enactor_events::{ClientIdentity, DispatchPolicy, DEFAULT_IDENTITY_PATH};
use enactor_reconciler::{ObserverConfig, PolicyConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnactorConfig {
    #[serde(default)]
    pub observer: ObserverSection,

    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub bus: BusSection,

    #[serde(default)]
    pub deleters: DeletersSection,

    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Observer loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverSection {
    #[serde(with = "duration_secs", default = "default_observer_interval")]
    pub interval: Duration,

    #[serde(with = "duration_secs", default = "default_backend_timeout")]
    pub backend_timeout: Duration,

    #[serde(rename = "backoff_base_ms", with = "duration_millis", default = "default_backoff_base")]
    pub backoff_base: Duration,

    #[serde(with = "duration_secs", default = "default_backoff_max")]
    pub backoff_max: Duration,
}

/// Model policy runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySection {
    /// Off for service observers.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(with = "duration_secs", default = "default_policy_interval")]
    pub interval: Duration,
}

/// Event bus client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSection {
    /// Fixed client id; wins over the persisted one.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Deleter registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeletersSection {
    /// Plugin manifest directory. Without one, no deleters are registered.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub policy: DispatchPolicy,
}

impl Default for EnactorConfig {
    fn default() -> Self {
        Self {
            observer: ObserverSection::default(),
            policy: PolicySection::default(),
            bus: BusSection::default(),
            deleters: DeletersSection::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            interval: default_observer_interval(),
            backend_timeout: default_backend_timeout(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_policy_interval(),
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            client_id: None,
            identity_path: default_identity_path(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl EnactorConfig {
    /// Load from `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content).map_err(|e| Error::config_parse(path, e.to_string()))
        } else {
            toml::from_str(&content).map_err(|e| Error::config_parse(path, e.to_string()))
        }
    }

    /// Apply `ENACTOR_*` overrides read through `lookup`.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup("ENACTOR_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(client_id) = lookup("ENACTOR_CLIENT_ID") {
            self.bus.client_id = Some(client_id);
        }

        if let Some(path) = lookup("ENACTOR_IDENTITY_PATH") {
            self.bus.identity_path = PathBuf::from(path);
        }

        if let Some(dir) = lookup("ENACTOR_DELETERS_DIR") {
            self.deleters.dir = Some(PathBuf::from(dir));
        }

        if let Some(secs) = lookup("ENACTOR_OBSERVER_INTERVAL").and_then(|v| v.parse().ok()) {
            self.observer.interval = Duration::from_secs(secs);
        }

        if let Some(enabled) = lookup("ENACTOR_POLICY_ENABLED") {
            self.policy.enabled = !matches!(enabled.to_lowercase().as_str(), "0" | "false" | "no" | "off");
        }

        self
    }

    /// Reject values the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.observer.interval.is_zero() {
            return Err(Error::invalid_config("observer.interval must be positive"));
        }
        if self.observer.backend_timeout.is_zero() {
            return Err(Error::invalid_config("observer.backend_timeout must be positive"));
        }
        if self.observer.backoff_base > self.observer.backoff_max {
            return Err(Error::invalid_config(
                "observer.backoff_base_ms must not exceed observer.backoff_max",
            ));
        }
        if self.policy.enabled && self.policy.interval.is_zero() {
            return Err(Error::invalid_config("policy.interval must be positive"));
        }
        if self.bus.channel_capacity == 0 {
            return Err(Error::invalid_config("bus.channel_capacity must be positive"));
        }
        Ok(())
    }

    /// Configured client identity, if any.
    pub fn client_id(&self) -> Option<ClientIdentity> {
        self.bus.client_id.as_deref().and_then(ClientIdentity::new)
    }

    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            interval: self.observer.interval,
            backend_timeout: self.observer.backend_timeout,
            backoff_base: self.observer.backoff_base,
            backoff_max: self.observer.backoff_max,
        }
    }

    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            enabled: self.policy.enabled,
            interval: self.policy.interval,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_observer_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_backend_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

const fn default_backoff_max() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

const fn default_policy_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_identity_path() -> PathBuf {
    PathBuf::from(DEFAULT_IDENTITY_PATH)
}

const fn default_channel_capacity() -> usize {
    1024
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialization helper for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
