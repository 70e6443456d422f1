//! Agent-level configuration.
//!
//! The agent config is YAML. Durations are humantime strings (`"5s"`,
//! `"1m"`). Validation distinguishes structural problems that must fail
//! startup (missing WAL directory, duplicate instance names, static configs
//! combined with the scraping service) from per-config problems that are
//! reported per instance at apply time.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::{InstanceConfig, InstanceError, RemoteWriteConfig};

/// Errors from agent config validation. All are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no wal_directory configured")]
    NoWalDirectory,

    #[error("cannot use configs when scraping_service mode is enabled")]
    StaticConfigsWithClustering,

    #[error("instance names must be unique; found multiple instances with name {0}")]
    DuplicateInstanceName(String),

    #[error("error validating instance {name}")]
    InvalidInstance {
        name: String,
        #[source]
        source: InstanceError,
    },
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base directory instances store their WAL under. Passed to instances
    /// opaquely; the control plane never touches it.
    pub wal_directory: PathBuf,

    #[serde(default)]
    pub global: GlobalConfig,

    /// Static instance configs. Forbidden when the scraping service is
    /// enabled; changing them requires a process restart.
    #[serde(default)]
    pub configs: Vec<InstanceConfig>,

    /// How long a supervisor waits before restarting a crashed instance.
    #[serde(default = "default_instance_restart_backoff", with = "duration")]
    pub instance_restart_backoff: Duration,

    #[serde(default)]
    pub scraping_service: ScrapingServiceConfig,

    #[serde(default)]
    pub scraping_service_client: StoreClientConfig,
}

impl AgentConfig {
    /// Check that the config can start an agent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wal_directory.as_os_str().is_empty() {
            return Err(ConfigError::NoWalDirectory);
        }

        if self.scraping_service.enabled && !self.configs.is_empty() {
            return Err(ConfigError::StaticConfigsWithClustering);
        }

        let mut used_names = HashSet::new();
        for cfg in &self.configs {
            if !used_names.insert(cfg.name.as_str()) {
                return Err(ConfigError::DuplicateInstanceName(cfg.name.clone()));
            }
            cfg.validate().map_err(|source| ConfigError::InvalidInstance {
                name: cfg.name.clone(),
                source,
            })?;
        }

        Ok(())
    }
}

/// Defaults merged into each instance config before apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_scrape_interval", with = "duration")]
    pub scrape_interval: Duration,

    #[serde(default = "default_scrape_timeout", with = "duration")]
    pub scrape_timeout: Duration,

    /// Labels attached to every forwarded sample.
    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,

    /// Sinks inherited by instances that configure none of their own.
    #[serde(default)]
    pub remote_write: Vec<RemoteWriteConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
            external_labels: BTreeMap::new(),
            remote_write: Vec::new(),
        }
    }
}

/// Clustered-mode settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingServiceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cadence of the periodic full refresh.
    #[serde(default = "default_reshard_interval", with = "duration")]
    pub reshard_interval: Duration,

    /// Upper bound on a single refresh. Zero disables the bound.
    #[serde(default = "default_reshard_timeout", with = "duration")]
    pub reshard_timeout: Duration,
}

impl Default for ScrapingServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reshard_interval: default_reshard_interval(),
            reshard_timeout: default_reshard_timeout(),
        }
    }
}

/// Opaque settings for whatever store/ownership backend the host wires in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreClientConfig {
    /// Key prefix configs are stored under.
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            prefix: default_store_prefix(),
        }
    }
}

fn default_instance_restart_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reshard_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reshard_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_store_prefix() -> String {
    "configurations/".to_string()
}

/// Whether two serializable values render to identical YAML.
pub(crate) fn yaml_equal<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_yaml::to_string(a), serde_yaml::to_string(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Serde support for `Duration` fields as humantime strings.
pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde support for `Option<Duration>` fields as humantime strings.
pub(crate) mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => {
                serializer.serialize_some(&humantime::format_duration(*value).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
