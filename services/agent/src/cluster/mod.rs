//! Clustered scraping service.
//!
//! In clustered mode many agent replicas share one config store and
//! partition its keys by consistent ownership. Each replica runs a single
//! [`ConfigWatcher`] that keeps the local instance manager converged on the
//! set of keys it owns, reacting to store mutations as they stream in and
//! resharding periodically to catch anything the stream missed.

pub mod watcher;

use std::sync::Arc;

use lode_ring::HashRing;

use crate::instance::InstanceConfig;

pub use watcher::{ConfigWatcher, EventOutcome, WatcherError};

/// Ownership predicate over config keys. Errors mean the membership view is
/// unavailable; callers treat that as "not owned", never as ownership.
pub type OwnershipFn = Arc<dyn Fn(&str) -> anyhow::Result<bool> + Send + Sync>;

/// Per-config validation hook run before a config is handed to the manager.
pub type ValidationFn = Arc<dyn Fn(&InstanceConfig) -> anyhow::Result<()> + Send + Sync>;

/// Adapt a shared hash ring into an [`OwnershipFn`].
pub fn ring_ownership(ring: Arc<HashRing>) -> OwnershipFn {
    Arc::new(move |key: &str| Ok(ring.owns(key)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_ownership_single_member() {
        let ring = Arc::new(HashRing::new("a"));
        ring.set_members(vec!["a".to_string()]);

        let owns = ring_ownership(ring);
        assert!(owns("any-key").unwrap());
    }

    #[test]
    fn test_ring_ownership_surfaces_errors() {
        let ring = Arc::new(HashRing::new("a"));
        let owns = ring_ownership(ring);
        assert!(owns("any-key").is_err());
    }
}
