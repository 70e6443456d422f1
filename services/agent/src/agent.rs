//! Top-level agent lifecycle.
//!
//! The agent runs in one of two modes:
//!
//! - **Single-node**: the static `configs` list is applied to the instance
//!   manager at startup; changing it requires a process restart.
//! - **Clustered** (`scraping_service.enabled`): a [`ConfigWatcher`] keeps
//!   the manager converged on the owned subset of a shared config store.
//!   Static configs are rejected at validation time.

use std::sync::Arc;

use lode_store::Store;
use prometheus::Registry;
use thiserror::Error;
use tracing::{debug, error};

use crate::cluster::{ConfigWatcher, OwnershipFn, ValidationFn};
use crate::config::{AgentConfig, ConfigError};
use crate::instance::{InstanceConfig, InstanceFactory};
use crate::manager::{InstanceManager, Manager, ManagerError};
use crate::metrics::Metrics;

/// Errors from agent startup.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to register agent metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// `Agent::new` was called with the scraping service enabled; clustered
    /// mode needs a store and an ownership callback.
    #[error("scraping service mode requires cluster dependencies, use Agent::clustered")]
    MissingClusterDependencies,

    /// `Agent::clustered` was called without the scraping service enabled.
    #[error("scraping service mode is not enabled in this configuration")]
    ClusteringDisabled,
}

/// A running metrics agent: instance manager plus, in clustered mode, the
/// config watcher driving it.
pub struct Agent {
    manager: Arc<InstanceManager>,
    watcher: Option<ConfigWatcher>,
}

impl Agent {
    /// Start a single-node agent, applying the static config list.
    pub async fn new(
        cfg: AgentConfig,
        factory: Arc<dyn InstanceFactory>,
        registry: &Registry,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;
        if cfg.scraping_service.enabled {
            return Err(AgentError::MissingClusterDependencies);
        }

        let metrics = Arc::new(Metrics::new(registry)?);
        let manager = build_manager(&cfg, factory, metrics);
        for instance_cfg in cfg.configs {
            manager.apply_config(instance_cfg).await?;
        }

        Ok(Self {
            manager,
            watcher: None,
        })
    }

    /// Start a clustered agent against the given store and ownership
    /// predicate, and kick off an initial refresh.
    pub async fn clustered(
        cfg: AgentConfig,
        factory: Arc<dyn InstanceFactory>,
        registry: &Registry,
        store: Arc<dyn Store<InstanceConfig>>,
        owns: OwnershipFn,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;
        if !cfg.scraping_service.enabled {
            return Err(AgentError::ClusteringDisabled);
        }

        let metrics = Arc::new(Metrics::new(registry)?);
        let manager = build_manager(&cfg, factory, Arc::clone(&metrics));

        let global = cfg.global.clone();
        let validate: ValidationFn = Arc::new(move |instance_cfg: &InstanceConfig| {
            let mut instance_cfg = instance_cfg.clone();
            instance_cfg.apply_defaults(&global);
            instance_cfg.validate()?;
            Ok(())
        });

        let watcher = ConfigWatcher::new(
            cfg.scraping_service,
            store,
            Arc::clone(&manager) as Arc<dyn Manager>,
            owns,
            validate,
            metrics,
        );
        // Converge now instead of waiting out the first reshard interval.
        watcher.request_refresh();

        Ok(Self {
            manager,
            watcher: Some(watcher),
        })
    }

    /// The instance manager hosting this agent's instances.
    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Schedule a reshard outside the periodic cadence.
    pub fn request_refresh(&self) {
        match &self.watcher {
            Some(watcher) => watcher.request_refresh(),
            None => debug!("refresh requested while the scraping service is disabled"),
        }
    }

    /// Stop the agent: the watcher first so it cannot re-apply configs, then
    /// the manager and every instance.
    pub async fn stop(self) {
        if let Some(watcher) = &self.watcher {
            if let Err(err) = watcher.stop().await {
                error!(error = %err, "failed to stop scraping service watcher");
            }
        }
        self.manager.stop().await;
    }
}

fn build_manager(
    cfg: &AgentConfig,
    factory: Arc<dyn InstanceFactory>,
    metrics: Arc<Metrics>,
) -> Arc<InstanceManager> {
    Arc::new(InstanceManager::new(
        cfg.global.clone(),
        cfg.wal_directory.clone(),
        cfg.instance_restart_backoff,
        factory,
        metrics,
    ))
}
