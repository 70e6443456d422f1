//! Config watcher: binds the store, the ownership predicate and the instance
//! manager into one reconciliation loop.
//!
//! The watcher is the sole mutator of the instance manager in clustered mode.
//! Its single task serves four event sources: shutdown, the reshard timer,
//! the coalesced refresh ticket, and the store's watch stream. Watch events
//! keep the agent current between reshards; the periodic refresh is the only
//! place where the *absence* of a key is detected, so it is also the fence
//! that repairs anything a lagging watch stream missed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use lode_store::{KeyFilter, Store, WatchEvent};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::{OwnershipFn, ValidationFn};
use crate::config::{yaml_equal, ScrapingServiceConfig};
use crate::instance::InstanceConfig;
use crate::manager::Manager;
use crate::metrics::Metrics;

/// Errors from watcher operations.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// `stop` was called more than once.
    #[error("config watcher already stopped")]
    AlreadyStopped,

    /// An operation arrived after the watcher stopped.
    #[error("config watcher stopped")]
    Stopped,
}

/// Per-batch observability partition: which event keys were applied or
/// deleted successfully and which failed validation or apply.
#[derive(Debug, Default)]
pub struct EventOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
}

/// Watches the config store and applies owned configs to the manager.
pub struct ConfigWatcher {
    inner: Arc<WatcherInner>,
    shutdown_tx: watch::Sender<bool>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

struct WatcherInner {
    /// Configuration fields; never held across I/O.
    state: StdMutex<WatcherState>,

    store: Arc<dyn Store<InstanceConfig>>,
    manager: Arc<dyn Manager>,
    owns: OwnershipFn,
    validate: ValidationFn,
    metrics: Arc<Metrics>,

    /// Single-slot refresh ticket; enqueueing while pending is a no-op.
    refresh_tx: mpsc::Sender<()>,

    /// Keys this watcher currently tracks. Held across the batched apply so
    /// table and intent cannot diverge.
    instances: Mutex<HashSet<String>>,

    /// Prototype receiver cloned by refreshes to observe cancellation.
    shutdown: watch::Receiver<bool>,
}

struct WatcherState {
    cfg: ScrapingServiceConfig,
    stopped: bool,
}

impl ConfigWatcher {
    /// Create a watcher and start its reconciliation loop.
    pub fn new(
        cfg: ScrapingServiceConfig,
        store: Arc<dyn Store<InstanceConfig>>,
        manager: Arc<dyn Manager>,
        owns: OwnershipFn,
        validate: ValidationFn,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        let inner = Arc::new(WatcherInner {
            state: StdMutex::new(WatcherState {
                cfg,
                stopped: false,
            }),
            store,
            manager,
            owns,
            validate,
            metrics,
            refresh_tx,
            instances: Mutex::new(HashSet::new()),
            shutdown: shutdown_rx.clone(),
        });

        let handle = tokio::spawn(Arc::clone(&inner).run(shutdown_rx, refresh_rx));

        Self {
            inner,
            shutdown_tx,
            handle: StdMutex::new(Some(handle)),
        }
    }

    /// Queue a refresh. No more than one refresh can be queued at a time.
    pub fn request_refresh(&self) {
        self.inner.request_refresh();
    }

    /// Update the watcher configuration. A materially identical config is a
    /// no-op.
    pub fn apply_config(&self, cfg: ScrapingServiceConfig) -> Result<(), WatcherError> {
        let mut state = self.inner.state.lock().expect("watcher state poisoned");
        if yaml_equal(&state.cfg, &cfg) {
            return Ok(());
        }
        if state.stopped {
            return Err(WatcherError::AlreadyStopped);
        }
        state.cfg = cfg;
        Ok(())
    }

    /// Stop the watcher and tear down every instance it tracked. Cannot be
    /// called more than once.
    pub async fn stop(&self) -> Result<(), WatcherError> {
        {
            let mut state = self.inner.state.lock().expect("watcher state poisoned");
            if state.stopped {
                return Err(WatcherError::AlreadyStopped);
            }
            state.stopped = true;
        }

        // Cancel the loop before deleting anything so it cannot re-apply
        // configs underneath us.
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().expect("watcher handle poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "config watcher task panicked");
            }
        }

        // Only the keys this watcher tracked: the manager may host instances
        // owned by other modes.
        let mut instances = self.inner.instances.lock().await;
        let keys: Vec<String> = instances.drain().collect();
        for key in keys {
            if let Err(err) = self.inner.manager.delete_config(&key).await {
                warn!(key = %key, error = %err, "failed deleting config on shutdown");
            }
        }

        Ok(())
    }
}

impl WatcherInner {
    fn request_refresh(&self) {
        match self.refresh_tx.try_send(()) {
            Ok(()) => debug!("successfully scheduled a refresh"),
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("ignoring refresh request: refresh already scheduled")
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("config watcher loop has exited, dropping refresh request")
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().expect("watcher state poisoned").stopped
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut refresh_rx: mpsc::Receiver<()>,
    ) {
        let mut watch_rx = self.store.watch().await;
        let mut last_reshard = Instant::now();

        loop {
            let reshard_interval = {
                let state = self.state.lock().expect("watcher state poisoned");
                state.cfg.reshard_interval
            };

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = sleep_until(last_reshard + reshard_interval) => {
                    info!("reshard timer ticked, scheduling refresh");
                    self.request_refresh();
                    last_reshard = Instant::now();
                }

                Some(()) = refresh_rx.recv() => {
                    if let Err(err) = self.refresh().await {
                        error!(error = %err, "refresh failed");
                    }
                }

                batch = watch_rx.recv() => match batch {
                    Some(batch) => {
                        debug!(events = batch.events.len(), "handling events from config store");
                        if let Err(err) = self.handle_events(batch.events).await {
                            error!(error = %err, "failed to handle config events");
                        }
                    }
                    None => {
                        warn!("config store watch stream closed, resubscribing");
                        watch_rx = self.store.watch().await;
                        self.request_refresh();
                    }
                },
            }
        }

        info!("config watcher run loop exiting");
    }

    /// Full reconciliation against the store. Only invoked from the run loop;
    /// queue one with [`request_refresh`].
    ///
    /// [`request_refresh`]: WatcherInner::request_refresh
    async fn refresh(&self) -> anyhow::Result<()> {
        let (enabled, reshard_timeout) = {
            let state = self.state.lock().expect("watcher state poisoned");
            (state.cfg.enabled, state.cfg.reshard_timeout)
        };
        if !enabled {
            debug!("refresh skipped because clustering is disabled");
            return Ok(());
        }
        info!("starting refresh");

        let start = std::time::Instant::now();
        let result = if reshard_timeout > Duration::ZERO {
            match tokio::time::timeout(reshard_timeout, self.refresh_inner()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "refresh deadline exceeded after {reshard_timeout:?}"
                )),
            }
        } else {
            self.refresh_inner().await
        };

        let duration = start.elapsed();
        let success = if result.is_ok() { "1" } else { "0" };
        self.metrics
            .reshard_duration
            .with_label_values(&[success])
            .observe(duration.as_secs_f64());
        match &result {
            Ok(()) => info!(?duration, "refresh finished"),
            Err(err) => info!(?duration, error = %err, "refresh finished"),
        }

        result
    }

    async fn refresh_inner(&self) -> anyhow::Result<()> {
        let mut cancel = self.shutdown.clone();
        if *cancel.borrow() {
            bail!("watcher shutting down before refresh could start");
        }

        let owns = Arc::clone(&self.owns);
        let keep: KeyFilter = Box::new(move |key: &str| match owns(key) {
            Ok(owned) => owned,
            Err(err) => {
                error!(
                    key = %key,
                    error = %err,
                    "failed to check for ownership, instance will be deleted if it is running"
                );
                false
            }
        });

        let mut batches = self
            .store
            .all(keep)
            .await
            .context("failed to get configs from store")?;

        let mut seen: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        bail!("refresh canceled");
                    }
                }
                batch = batches.recv() => {
                    let Some(batch) = batch else { break };
                    let events = batch
                        .into_iter()
                        .map(|(key, config)| {
                            seen.insert(key.clone());
                            WatchEvent {
                                key,
                                config: Some(config),
                            }
                        })
                        .collect();
                    self.handle_events(events).await?;
                }
            }
        }

        // Anything we run that the snapshot no longer contains is either
        // deleted or owned by someone else now. Snapshot the key set by value
        // so handle_events can retake the lock.
        let deleted: Vec<String> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .filter(|key| !seen.contains(*key))
                .cloned()
                .collect()
        };
        for key in deleted {
            if let Err(err) = self
                .handle_events(vec![WatchEvent {
                    key: key.clone(),
                    config: None,
                }])
                .await
            {
                error!(key = %key, error = %err, "failed to process deleted config");
            }
        }

        Ok(())
    }

    /// The serialized mutator of the instance table.
    async fn handle_events(
        &self,
        events: Vec<WatchEvent<InstanceConfig>>,
    ) -> Result<EventOutcome, WatcherError> {
        if self.is_stopped() {
            return Err(WatcherError::Stopped);
        }

        // Ownership and validation callbacks run before the instance lock is
        // taken; a callback that re-enters the watcher must not deadlock.
        let classified: Vec<ClassifiedEvent> = events
            .into_iter()
            .map(|ev| {
                let owned = match (self.owns)(&ev.key) {
                    Ok(owned) => owned,
                    Err(err) => {
                        error!(
                            key = %ev.key,
                            error = %err,
                            "failed to see if config is owned, instance will be deleted if it is running"
                        );
                        false
                    }
                };
                let invalid = match (&ev.config, owned) {
                    (Some(config), true) => (self.validate)(config).err().map(|e| e.to_string()),
                    _ => None,
                };
                ClassifiedEvent {
                    key: ev.key,
                    config: ev.config,
                    owned,
                    invalid,
                }
            })
            .collect();

        let mut outcome = EventOutcome::default();
        let mut apply = Vec::new();
        let mut instances = self.instances.lock().await;

        for ev in classified {
            let is_running = instances.contains(&ev.key);
            let is_deleted = ev.config.is_none();

            // Two deletion scenarios: a config we run moved to a new owner,
            // or a config we run was deleted outright.
            if (is_running && !ev.owned) || (is_deleted && is_running) {
                if is_deleted {
                    info!(key = %ev.key, "untracking deleted config");
                } else {
                    info!(key = %ev.key, "untracking config that changed owners");
                }
                instances.remove(&ev.key);
                match self.manager.delete_config(&ev.key).await {
                    Ok(()) => outcome.successful.push(ev.key),
                    Err(err) => {
                        error!(key = %ev.key, error = %err, "failed to delete instance");
                        outcome.failed.push(ev.key);
                    }
                }
            } else if !is_deleted && ev.owned {
                if let Some(reason) = ev.invalid {
                    error!(
                        key = %ev.key,
                        error = %reason,
                        "failed to validate config, it cannot run until the config or the global constraints are adjusted"
                    );
                    outcome.failed.push(ev.key);
                    continue;
                }

                if !is_running {
                    info!(key = %ev.key, "tracking new config");
                }
                instances.insert(ev.key.clone());
                if let Some(config) = ev.config {
                    apply.push(config);
                }
            }
            // Events for keys we neither own nor run are ignored.
        }

        // One batched apply per event batch; the instance lock stays held so
        // the tracked set and the manager's intent cannot diverge.
        let report = self.manager.apply_configs(apply).await;
        drop(instances);

        outcome.successful.extend(report.applied);
        for failed in report.failed {
            outcome.failed.push(failed.config.name);
        }
        Ok(outcome)
    }
}

struct ClassifiedEvent {
    key: String,
    config: Option<InstanceConfig>,
    owned: bool,
    invalid: Option<String>,
}
