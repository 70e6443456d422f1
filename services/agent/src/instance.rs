//! Instance configs and the supervised instance contract.
//!
//! An instance is an independently supervised scrape-and-forward worker keyed
//! by a unique name. The control plane never looks inside one: it creates
//! instances through an injectable [`InstanceFactory`] and drives them solely
//! through [`Instance::run`]. The scrape engine, WAL and remote-write client
//! all live behind that seam.
//!
//! [`MockInstance`] and [`MockFactory`] provide a scripted implementation for
//! tests: instances can be commanded to exit with chosen results and record
//! when each run started.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{duration_opt, GlobalConfig};

/// Errors from instance validation, creation and runtime.
#[derive(Debug, Error, Clone)]
pub enum InstanceError {
    /// The config was rejected before an instance was created.
    #[error("invalid instance config {name}: {reason}")]
    InvalidConfig { name: String, reason: String },

    /// The instance could not be created.
    #[error("failed to create instance {name}: {reason}")]
    Create { name: String, reason: String },

    /// The running pipeline failed.
    #[error("instance {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// A named scrape configuration.
///
/// `name` is the stable identity: two configs with the same name describe the
/// same logical instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,

    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,

    #[serde(default)]
    pub remote_write: Vec<RemoteWriteConfig>,

    /// Defaulted from the agent-level global config at apply time.
    #[serde(default, with = "duration_opt")]
    pub scrape_interval: Option<Duration>,

    #[serde(default, with = "duration_opt")]
    pub scrape_timeout: Option<Duration>,
}

/// One scrape job inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,

    /// Statically discovered targets, host:port.
    #[serde(default)]
    pub static_targets: Vec<String>,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default, with = "duration_opt")]
    pub scrape_interval: Option<Duration>,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// A remote sink samples are forwarded to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWriteConfig {
    #[serde(default)]
    pub name: Option<String>,

    pub url: String,
}

impl InstanceConfig {
    /// Create a config with the given name and no jobs or sinks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scrape_configs: Vec::new(),
            remote_write: Vec::new(),
            scrape_interval: None,
            scrape_timeout: None,
        }
    }

    /// Fill unset fields from the agent-level global config. Idempotent.
    pub fn apply_defaults(&mut self, global: &GlobalConfig) {
        self.scrape_interval.get_or_insert(global.scrape_interval);
        self.scrape_timeout.get_or_insert(global.scrape_timeout);

        if self.remote_write.is_empty() {
            self.remote_write = global.remote_write.clone();
        }

        let instance_interval = self.scrape_interval;
        for scrape in &mut self.scrape_configs {
            if let Some(interval) = instance_interval {
                scrape.scrape_interval.get_or_insert(interval);
            }
        }
    }

    /// Check the config for structural problems. Pure.
    pub fn validate(&self) -> Result<(), InstanceError> {
        if self.name.is_empty() {
            return Err(self.invalid("instance name must not be empty"));
        }

        if let Some(interval) = self.scrape_interval {
            if interval.is_zero() {
                return Err(self.invalid("scrape_interval must be positive"));
            }
        }

        let mut job_names = HashSet::new();
        for scrape in &self.scrape_configs {
            if scrape.job_name.is_empty() {
                return Err(self.invalid("scrape job_name must not be empty"));
            }
            if !job_names.insert(scrape.job_name.as_str()) {
                return Err(self.invalid(format!("duplicate scrape job {}", scrape.job_name)));
            }
        }

        for remote in &self.remote_write {
            if let Err(err) = url::Url::parse(&remote.url) {
                return Err(self.invalid(format!("bad remote_write url {}: {err}", remote.url)));
            }
        }

        Ok(())
    }

    /// Whether two configs are materially identical, compared through their
    /// YAML rendering.
    pub fn yaml_equal(&self, other: &InstanceConfig) -> bool {
        crate::config::yaml_equal(self, other)
    }

    fn invalid(&self, reason: impl Into<String>) -> InstanceError {
        InstanceError::InvalidConfig {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// A running scrape-and-forward worker.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Run the worker until `shutdown` is signaled or the pipeline fails.
    ///
    /// A return after the shutdown flag is set is a clean exit; any other
    /// return (including `Ok`) is abnormal and the supervisor restarts the
    /// instance after the configured backoff.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), InstanceError>;
}

/// Creates instances from validated configs. Injectable so tests can script
/// instance behavior.
pub trait InstanceFactory: Send + Sync {
    fn create(
        &self,
        global: &GlobalConfig,
        cfg: &InstanceConfig,
        wal_dir: &Path,
    ) -> Result<Box<dyn Instance>, InstanceError>;
}

// =============================================================================
// Scripted mock
// =============================================================================

/// Scripted instance for tests.
///
/// Each run pops the next scripted result and returns it; once the script is
/// exhausted the instance parks until shutdown and exits cleanly. Run start
/// times are recorded for backoff assertions.
pub struct MockInstance {
    name: String,
    script: Mutex<VecDeque<Result<(), InstanceError>>>,
    run_starts: Mutex<Vec<Instant>>,
}

impl MockInstance {
    fn new(name: String, script: VecDeque<Result<(), InstanceError>>) -> Self {
        Self {
            name,
            script: Mutex::new(script),
            run_starts: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times the supervisor has invoked `run`.
    pub fn runs(&self) -> usize {
        self.run_starts.lock().unwrap().len()
    }

    /// Start time of each run, in invocation order.
    pub fn run_starts(&self) -> Vec<Instant> {
        self.run_starts.lock().unwrap().clone()
    }

    async fn run_scripted(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), InstanceError> {
        self.run_starts.lock().unwrap().push(Instant::now());

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => loop {
                if *shutdown.borrow() {
                    return Ok(());
                }
                if shutdown.changed().await.is_err() {
                    return Ok(());
                }
            },
        }
    }
}

struct MockHandle(Arc<MockInstance>);

#[async_trait]
impl Instance for MockHandle {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), InstanceError> {
        self.0.run_scripted(shutdown).await
    }
}

/// Factory producing [`MockInstance`]s, with per-name scripts and optional
/// creation failures.
#[derive(Default)]
pub struct MockFactory {
    state: Mutex<MockFactoryState>,
}

#[derive(Default)]
struct MockFactoryState {
    scripts: HashMap<String, VecDeque<Result<(), InstanceError>>>,
    fail_create: HashSet<String>,
    created: HashMap<String, Vec<Arc<MockInstance>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the exit results for the next instance created under `name`.
    /// After the script runs out the instance parks until shutdown.
    pub fn script_exits(&self, name: &str, exits: Vec<Result<(), InstanceError>>) {
        let mut state = self.state.lock().unwrap();
        state.scripts.insert(name.to_string(), exits.into());
    }

    /// Make creation fail for `name`.
    pub fn fail_create(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.fail_create.insert(name.to_string());
    }

    /// The most recently created instance under `name`.
    pub fn instance(&self, name: &str) -> Option<Arc<MockInstance>> {
        let state = self.state.lock().unwrap();
        state.created.get(name).and_then(|v| v.last()).cloned()
    }

    /// How many instances were created under `name`.
    pub fn created(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.created.get(name).map(|v| v.len()).unwrap_or(0)
    }
}

impl InstanceFactory for MockFactory {
    fn create(
        &self,
        _global: &GlobalConfig,
        cfg: &InstanceConfig,
        _wal_dir: &Path,
    ) -> Result<Box<dyn Instance>, InstanceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create.contains(&cfg.name) {
            return Err(InstanceError::Create {
                name: cfg.name.clone(),
                reason: "scripted creation failure".to_string(),
            });
        }

        let script = state.scripts.remove(&cfg.name).unwrap_or_default();
        let instance = Arc::new(MockInstance::new(cfg.name.clone(), script));
        state
            .created
            .entry(cfg.name.clone())
            .or_default()
            .push(Arc::clone(&instance));
        Ok(Box::new(MockHandle(instance)))
    }
}
