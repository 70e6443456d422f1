//! In-memory store implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::{KeyFilter, Store, StoreError, WatchBatch, WatchEvent, WatchStream};

const DEFAULT_BATCH_SIZE: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// In-process [`Store`] backed by a map and a broadcast event channel.
pub struct MemoryStore<C> {
    inner: Arc<Inner<C>>,
    batch_size: usize,
}

struct Inner<C> {
    entries: RwLock<BTreeMap<String, C>>,
    events: broadcast::Sender<WatchBatch<C>>,
}

impl<C: Clone + Send + Sync + 'static> MemoryStore<C> {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    /// Create a store that delivers `all` snapshots in batches of `batch_size`.
    pub fn with_batch_size(batch_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                events,
            }),
            batch_size: batch_size.max(1),
        }
    }

    fn snapshot(inner: &Inner<C>) -> WatchBatch<C> {
        let entries = inner.entries.read().expect("store lock poisoned");
        WatchBatch {
            events: entries
                .iter()
                .map(|(key, config)| WatchEvent {
                    key: key.clone(),
                    config: Some(config.clone()),
                })
                .collect(),
        }
    }

    fn emit(&self, key: &str, config: Option<C>) {
        // No subscribers is fine; watch consumers resync on subscribe lag.
        let _ = self.inner.events.send(WatchBatch {
            events: vec![WatchEvent {
                key: key.to_string(),
                config,
            }],
        });
    }
}

impl<C: Clone + Send + Sync + 'static> Default for MemoryStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Clone + Send + Sync + 'static> Store<C> for MemoryStore<C> {
    async fn all(&self, keep: KeyFilter) -> Result<mpsc::Receiver<Vec<(String, C)>>, StoreError> {
        let kept: Vec<(String, C)> = {
            let entries = self.inner.entries.read().expect("store lock poisoned");
            entries
                .iter()
                .filter(|(key, _)| keep(key))
                .map(|(key, config)| (key.clone(), config.clone()))
                .collect()
        };
        debug!(kept = kept.len(), "enumerating store snapshot");

        let batch_size = self.batch_size;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for chunk in kept.chunks(batch_size) {
                if tx.send(chunk.to_vec()).await.is_err() {
                    // Receiver dropped; abort the enumeration.
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn watch(&self) -> WatchStream<C> {
        let inner = Arc::clone(&self.inner);
        WatchStream::new(self.inner.events.subscribe(), move || {
            Self::snapshot(&inner)
        })
    }

    async fn put(&self, key: &str, config: C) -> Result<(), StoreError> {
        {
            let mut entries = self.inner.entries.write().expect("store lock poisoned");
            entries.insert(key.to_string(), config.clone());
        }
        self.emit(key, Some(config));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<C>, StoreError> {
        let entries = self.inner.entries.read().expect("store lock poisoned");
        Ok(entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let removed = {
            let mut entries = self.inner.entries.write().expect("store lock poisoned");
            entries.remove(key)
        };
        if removed.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.emit(key, None);
        Ok(())
    }
}
