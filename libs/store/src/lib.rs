//! # lode-store
//!
//! Durable, watchable key-to-config mapping backing the clustered scraping
//! service.
//!
//! The [`Store`] trait is the seam between the config watcher and whatever
//! backend actually holds the configs. A backend must provide:
//!
//! - snapshot enumeration in batches ([`Store::all`]), aborted promptly when
//!   the caller walks away
//! - a long-lived mutation stream ([`Store::watch`]) that survives consumer
//!   lag by resynchronizing rather than dropping updates
//! - plain `put`/`get`/`delete`
//!
//! [`MemoryStore`] is the in-process implementation used by single-binary
//! deployments and the test suites. Remote backends implement the same trait
//! out of tree.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

pub use memory::MemoryStore;

/// A single config mutation. `config: None` means the key was deleted.
#[derive(Debug, Clone)]
pub struct WatchEvent<C> {
    pub key: String,
    pub config: Option<C>,
}

/// A batch of mutations delivered together. The store may coalesce
/// consecutive updates to the same key into the latest one.
#[derive(Debug, Clone)]
pub struct WatchBatch<C> {
    pub events: Vec<WatchEvent<C>>,
}

/// Snapshot filter applied to keys during [`Store::all`].
pub type KeyFilter = Box<dyn Fn(&str) -> bool + Send>;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The backend failed or is unreachable.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable, watchable mapping of config key to config.
#[async_trait]
pub trait Store<C>: Send + Sync
where
    C: Clone + Send + Sync + 'static,
{
    /// Enumerate a snapshot of all configs whose key passes `keep`, delivered
    /// in batches. The channel closes once the snapshot is exhausted.
    /// Dropping the receiver aborts the enumeration promptly.
    async fn all(&self, keep: KeyFilter) -> Result<mpsc::Receiver<Vec<(String, C)>>, StoreError>;

    /// Subscribe to the mutation stream.
    async fn watch(&self) -> WatchStream<C>;

    /// Insert or replace the config stored under `key`.
    async fn put(&self, key: &str, config: C) -> Result<(), StoreError>;

    /// Fetch the config stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<C>, StoreError>;

    /// Remove the config stored under `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// A live subscription to a store's mutation stream.
///
/// The stream tolerates a lagging consumer: when the underlying channel
/// reports that events were discarded, the subscription re-attaches and the
/// next received batch is a full resync of every live config, so no update is
/// missed. Deletions dropped during the gap are reconciled by the consumer's
/// next reshard, which is the only place absence is detected.
pub struct WatchStream<C> {
    rx: broadcast::Receiver<WatchBatch<C>>,
    resync: Box<dyn Fn() -> WatchBatch<C> + Send + Sync>,
}

impl<C: Clone + Send + Sync + 'static> WatchStream<C> {
    /// Build a stream from a raw event subscription and a resync snapshot
    /// function. Backends call this; consumers only call [`recv`].
    ///
    /// [`recv`]: WatchStream::recv
    pub fn new(
        rx: broadcast::Receiver<WatchBatch<C>>,
        resync: impl Fn() -> WatchBatch<C> + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            resync: Box::new(resync),
        }
    }

    /// Receive the next batch. Returns `None` once the store has shut down.
    pub async fn recv(&mut self) -> Option<WatchBatch<C>> {
        match self.rx.recv().await {
            Ok(batch) => Some(batch),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "watch stream lagged, resynchronizing");
                // Re-attach before snapshotting so nothing lands in the gap
                // between the snapshot and the new subscription.
                self.rx = self.rx.resubscribe();
                Some((self.resync)())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
