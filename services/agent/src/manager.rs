//! Instance manager: tracks running instances and supervises them.
//!
//! The manager owns the mapping from instance name to running instance plus
//! an "intended config" shadow. It is the single source of truth for what is
//! running on this agent. Callers may rely on intent having been recorded
//! when an apply returns, never on the instance already being in a running
//! state.
//!
//! Each tracked instance is driven by a supervisor task that re-invokes
//! [`Instance::run`] after a fixed backoff whenever it returns without
//! shutdown having been signaled. Shutdown-driven returns end supervision
//! cleanly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GlobalConfig;
use crate::instance::{Instance, InstanceConfig, InstanceError, InstanceFactory};
use crate::metrics::Metrics;

/// Errors from manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager has been stopped; no further applies or deletes.
    #[error("instance manager is stopped")]
    Stopped,

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Result of a batched apply: which configs were accepted and which were
/// rejected, keyed by instance name. Rejects keep the offending config so
/// failures can be routed back to the events that carried them.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub failed: Vec<FailedApply>,
}

#[derive(Debug)]
pub struct FailedApply {
    pub config: InstanceConfig,
    pub error: ManagerError,
}

/// The manager surface the config watcher drives. Tests substitute scripted
/// implementations.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Upsert one config. No-op when the config is materially unchanged.
    async fn apply_config(&self, cfg: InstanceConfig) -> Result<(), ManagerError>;

    /// Upsert a batch of configs, reporting accepts and rejects per name.
    async fn apply_configs(&self, cfgs: Vec<InstanceConfig>) -> ApplyReport;

    /// Stop and untrack the named instance. Deleting an unknown name
    /// succeeds.
    async fn delete_config(&self, name: &str) -> Result<(), ManagerError>;

    /// Snapshot of the current intent.
    async fn list_configs(&self) -> HashMap<String, InstanceConfig>;
}

/// Supervising manager of scrape instances.
pub struct InstanceManager {
    global: GlobalConfig,
    wal_dir: PathBuf,
    restart_backoff: Duration,
    factory: Arc<dyn InstanceFactory>,
    metrics: Arc<Metrics>,

    stopped: AtomicBool,

    /// Intended config per instance. Readable concurrently with applies.
    configs: RwLock<HashMap<String, InstanceConfig>>,

    /// Running instances. The lock serializes apply/delete.
    processes: Mutex<HashMap<String, ManagedInstance>>,
}

struct ManagedInstance {
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl InstanceManager {
    pub fn new(
        global: GlobalConfig,
        wal_dir: PathBuf,
        restart_backoff: Duration,
        factory: Arc<dyn InstanceFactory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            global,
            wal_dir,
            restart_backoff,
            factory,
            metrics,
            stopped: AtomicBool::new(false),
            configs: RwLock::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Stop every instance. Applies and deletes fail afterwards.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<ManagedInstance> = {
            let mut processes = self.processes.lock().await;
            processes.drain().map(|(_, proc)| proc).collect()
        };
        self.configs.write().expect("config lock poisoned").clear();

        info!(count = drained.len(), "stopping all instances");
        for proc in &drained {
            let _ = proc.shutdown.send(true);
        }
        for proc in drained {
            if let Err(err) = proc.supervisor.await {
                warn!(error = %err, "instance supervisor task panicked");
            }
        }

        self.metrics.active_configs.set(0);
    }

    async fn apply_locked(
        &self,
        processes: &mut HashMap<String, ManagedInstance>,
        mut cfg: InstanceConfig,
    ) -> Result<(), ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::Stopped);
        }

        cfg.apply_defaults(&self.global);
        cfg.validate()?;

        let unchanged = {
            let configs = self.configs.read().expect("config lock poisoned");
            configs
                .get(&cfg.name)
                .map(|current| current.yaml_equal(&cfg))
                .unwrap_or(false)
        };
        if unchanged {
            debug!(instance = %cfg.name, "config unchanged, nothing to apply");
            return Ok(());
        }

        // Create the replacement before touching the old instance so a
        // creation failure leaves the running instance untouched.
        let instance = self.factory.create(&self.global, &cfg, &self.wal_dir)?;

        if let Some(old) = processes.remove(&cfg.name) {
            info!(instance = %cfg.name, "config changed, restarting instance");
            stop_process(old).await;
        } else {
            info!(instance = %cfg.name, "starting new instance");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(
            instance,
            cfg.name.clone(),
            shutdown_rx,
            self.restart_backoff,
            Arc::clone(&self.metrics),
        ));
        processes.insert(
            cfg.name.clone(),
            ManagedInstance {
                shutdown: shutdown_tx,
                supervisor,
            },
        );
        {
            let mut configs = self.configs.write().expect("config lock poisoned");
            configs.insert(cfg.name.clone(), cfg);
        }
        self.metrics.active_configs.set(processes.len() as i64);

        Ok(())
    }
}

#[async_trait]
impl Manager for InstanceManager {
    async fn apply_config(&self, cfg: InstanceConfig) -> Result<(), ManagerError> {
        let mut processes = self.processes.lock().await;
        self.apply_locked(&mut processes, cfg).await
    }

    async fn apply_configs(&self, cfgs: Vec<InstanceConfig>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut processes = self.processes.lock().await;

        for cfg in cfgs {
            match self.apply_locked(&mut processes, cfg.clone()).await {
                Ok(()) => report.applied.push(cfg.name),
                Err(error) => {
                    error!(instance = %cfg.name, error = %error, "failed to apply config");
                    report.failed.push(FailedApply { config: cfg, error });
                }
            }
        }

        report
    }

    async fn delete_config(&self, name: &str) -> Result<(), ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::Stopped);
        }

        let mut processes = self.processes.lock().await;
        let Some(proc) = processes.remove(name) else {
            debug!(instance = %name, "delete of unknown instance");
            return Ok(());
        };

        {
            let mut configs = self.configs.write().expect("config lock poisoned");
            configs.remove(name);
        }
        self.metrics.active_configs.set(processes.len() as i64);

        info!(instance = %name, "deleting instance");
        stop_process(proc).await;
        Ok(())
    }

    async fn list_configs(&self) -> HashMap<String, InstanceConfig> {
        self.configs.read().expect("config lock poisoned").clone()
    }
}

/// Signal an instance to stop and wait for its supervisor to wind down.
async fn stop_process(proc: ManagedInstance) {
    let _ = proc.shutdown.send(true);
    if let Err(err) = proc.supervisor.await {
        warn!(error = %err, "instance supervisor task panicked");
    }
}

/// Per-instance supervision loop.
///
/// A return from `run` with the shutdown flag set ends supervision cleanly.
/// Any other return, error or not, counts as an abnormal exit and the
/// instance is re-run after the restart backoff. The backoff sleep itself
/// stays responsive to shutdown.
async fn supervise(
    instance: Box<dyn Instance>,
    name: String,
    mut shutdown: watch::Receiver<bool>,
    backoff: Duration,
    metrics: Arc<Metrics>,
) {
    loop {
        let result = instance.run(shutdown.clone()).await;

        if *shutdown.borrow() {
            info!(instance = %name, "stopped instance");
            return;
        }

        metrics
            .instance_abnormal_exits
            .with_label_values(&[&name])
            .inc();
        match result {
            Err(err) => error!(
                instance = %name,
                error = %err,
                backoff = ?backoff,
                "instance stopped abnormally, restarting after backoff period"
            ),
            Ok(()) => error!(
                instance = %name,
                backoff = ?backoff,
                "instance exited before shutdown, restarting after backoff period"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(instance = %name, "stopped instance during restart backoff");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::MockFactory;
    use prometheus::Registry;

    fn manager_with_factory() -> (InstanceManager, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::new());
        let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
        let manager = InstanceManager::new(
            GlobalConfig::default(),
            PathBuf::from("/tmp/wal"),
            Duration::from_millis(10),
            Arc::clone(&factory) as Arc<dyn InstanceFactory>,
            metrics,
        );
        (manager, factory)
    }

    #[tokio::test]
    async fn test_apply_and_delete_track_intent() {
        let (manager, _factory) = manager_with_factory();

        manager
            .apply_config(InstanceConfig::new("a"))
            .await
            .unwrap();
        manager
            .apply_config(InstanceConfig::new("b"))
            .await
            .unwrap();

        let mut names: Vec<String> = manager.list_configs().await.into_keys().collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        manager.delete_config("a").await.unwrap();
        let names: Vec<String> = manager.list_configs().await.into_keys().collect();
        assert_eq!(names, vec!["b".to_string()]);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unique_names_across_apply_delete_sequences() {
        let (manager, _factory) = manager_with_factory();

        // Apply a, b, c; delete b; re-apply b; delete c.
        for name in ["a", "b", "c"] {
            manager
                .apply_config(InstanceConfig::new(name))
                .await
                .unwrap();
        }
        manager.delete_config("b").await.unwrap();
        manager
            .apply_config(InstanceConfig::new("b"))
            .await
            .unwrap();
        manager.delete_config("c").await.unwrap();

        let mut names: Vec<String> = manager.list_configs().await.into_keys().collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unchanged_config_is_a_noop() {
        let (manager, factory) = manager_with_factory();

        let cfg = InstanceConfig::new("a");
        manager.apply_config(cfg.clone()).await.unwrap();
        manager.apply_config(cfg).await.unwrap();

        assert_eq!(factory.created("a"), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_changed_config_replaces_instance() {
        let (manager, factory) = manager_with_factory();

        manager
            .apply_config(InstanceConfig::new("a"))
            .await
            .unwrap();

        let mut changed = InstanceConfig::new("a");
        changed.scrape_interval = Some(Duration::from_secs(15));
        manager.apply_config(changed).await.unwrap();

        assert_eq!(factory.created("a"), 2);
        assert_eq!(manager.list_configs().await.len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_creation_failure_is_not_tracked() {
        let (manager, factory) = manager_with_factory();
        factory.fail_create("bad");

        let result = manager.apply_config(InstanceConfig::new("bad")).await;
        assert!(matches!(
            result,
            Err(ManagerError::Instance(InstanceError::Create { .. }))
        ));
        assert!(manager.list_configs().await.is_empty());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_creation_failure_keeps_old_instance() {
        let (manager, factory) = manager_with_factory();

        manager
            .apply_config(InstanceConfig::new("a"))
            .await
            .unwrap();
        factory.fail_create("a");

        let mut changed = InstanceConfig::new("a");
        changed.scrape_interval = Some(Duration::from_secs(15));
        assert!(manager.apply_config(changed).await.is_err());

        // The original instance and its intent survive the failed swap.
        let configs = manager.list_configs().await;
        assert_eq!(
            configs.get("a").and_then(|c| c.scrape_interval),
            Some(GlobalConfig::default().scrape_interval)
        );
        assert_eq!(factory.created("a"), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_apply_configs_partitions_by_name() {
        let (manager, factory) = manager_with_factory();
        factory.fail_create("bad");

        let report = manager
            .apply_configs(vec![
                InstanceConfig::new("good"),
                InstanceConfig::new("bad"),
                InstanceConfig::new(""),
            ])
            .await;

        assert_eq!(report.applied, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].config.name, "bad");
        assert_eq!(report.failed[1].config.name, "");

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_delete_unknown_is_idempotent() {
        let (manager, _factory) = manager_with_factory();
        manager.delete_config("ghost").await.unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_manager_rejects_calls() {
        let (manager, _factory) = manager_with_factory();
        manager.stop().await;
        manager.stop().await; // second stop is a no-op

        assert!(matches!(
            manager.apply_config(InstanceConfig::new("a")).await,
            Err(ManagerError::Stopped)
        ));
        assert!(matches!(
            manager.delete_config("a").await,
            Err(ManagerError::Stopped)
        ));

        let report = manager.apply_configs(vec![InstanceConfig::new("a")]).await;
        assert!(report.applied.is_empty());
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_instances_cleanly() {
        let (manager, factory) = manager_with_factory();
        let registry_metrics = manager.metrics.clone();

        manager
            .apply_config(InstanceConfig::new("a"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.stop().await;

        let instance = factory.instance("a").unwrap();
        assert_eq!(instance.runs(), 1);
        assert_eq!(
            registry_metrics
                .instance_abnormal_exits
                .with_label_values(&["a"])
                .get(),
            0
        );
        assert_eq!(registry_metrics.active_configs.get(), 0);
    }
}
