//! # lode-ring
//!
//! Consistent-hash ownership for the lode clustered scraping service.
//!
//! Every agent replica holds a [`HashRing`] describing the same membership
//! view and answers one question: does *this* replica own a given config key?
//! Replicas agree on ownership as long as their views agree; when views
//! diverge (a member joined or left and not everyone has noticed yet), keys
//! may briefly be owned by zero or two replicas. The scraping service
//! tolerates that by resharding periodically, so the ring makes no attempt to
//! coordinate views itself.
//!
//! ## Design Principles
//!
//! - Ownership is a pure function of (membership view, key)
//! - Keys move between replicas only when membership changes
//! - An unavailable view (empty, or not containing the local replica) is an
//!   error, never a positive ownership claim

use std::collections::BTreeMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Virtual tokens placed on the ring per member.
pub const DEFAULT_TOKENS_PER_MEMBER: usize = 128;

/// Errors from ownership checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The membership view is empty.
    #[error("ring has no members")]
    NoMembers,

    /// The local replica is not part of the membership view.
    #[error("local replica {0} is not a ring member")]
    NotMember(String),
}

/// A consistent-hash ring over named replicas.
///
/// The membership view is replaceable at runtime via [`HashRing::set_members`];
/// `owns` reads whatever view is current, so answers may flip between calls.
pub struct HashRing {
    local: String,
    tokens_per_member: usize,
    state: RwLock<RingState>,
}

struct RingState {
    /// Token position on the ring to owning member.
    tokens: BTreeMap<u64, String>,
    members: Vec<String>,
}

impl HashRing {
    /// Create an empty ring for the given local replica name.
    pub fn new(local: impl Into<String>) -> Self {
        Self::with_tokens(local, DEFAULT_TOKENS_PER_MEMBER)
    }

    /// Create an empty ring with a custom virtual-token count.
    pub fn with_tokens(local: impl Into<String>, tokens_per_member: usize) -> Self {
        Self {
            local: local.into(),
            tokens_per_member: tokens_per_member.max(1),
            state: RwLock::new(RingState {
                tokens: BTreeMap::new(),
                members: Vec::new(),
            }),
        }
    }

    /// The local replica name this ring answers ownership for.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Replace the membership view. Duplicate names are collapsed.
    pub fn set_members(&self, members: Vec<String>) {
        let mut members = members;
        members.sort();
        members.dedup();

        let mut tokens = BTreeMap::new();
        for member in &members {
            for vnode in 0..self.tokens_per_member {
                tokens.insert(token_position(member, vnode), member.clone());
            }
        }

        let mut state = self.state.write().expect("ring lock poisoned");
        state.tokens = tokens;
        state.members = members;
    }

    /// Snapshot of the current membership view.
    pub fn members(&self) -> Vec<String> {
        self.state
            .read()
            .expect("ring lock poisoned")
            .members
            .clone()
    }

    /// The member that owns `key` under the current view.
    pub fn owner_of(&self, key: &str) -> Result<String, RingError> {
        let state = self.state.read().expect("ring lock poisoned");
        if state.tokens.is_empty() {
            return Err(RingError::NoMembers);
        }
        if !state.members.iter().any(|m| m == &self.local) {
            return Err(RingError::NotMember(self.local.clone()));
        }

        let hash = key_position(key);
        let owner = state
            .tokens
            .range(hash..)
            .next()
            .or_else(|| state.tokens.iter().next())
            .map(|(_, member)| member.clone())
            .ok_or(RingError::NoMembers)?;
        Ok(owner)
    }

    /// Whether the local replica owns `key` under the current view.
    pub fn owns(&self, key: &str) -> Result<bool, RingError> {
        Ok(self.owner_of(key)? == self.local)
    }
}

fn token_position(member: &str, vnode: usize) -> u64 {
    hash64(format!("{member}/{vnode}").as_bytes())
}

fn key_position(key: &str) -> u64 {
    hash64(key.as_bytes())
}

fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("digest shorter than 8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("config-{i}")).collect()
    }

    #[test]
    fn test_empty_ring_errors() {
        let ring = HashRing::new("a");
        assert_eq!(ring.owns("k"), Err(RingError::NoMembers));
    }

    #[test]
    fn test_local_not_member_errors() {
        let ring = HashRing::new("a");
        ring.set_members(vec!["b".to_string(), "c".to_string()]);
        assert_eq!(ring.owns("k"), Err(RingError::NotMember("a".to_string())));
    }

    #[test]
    fn test_single_member_owns_everything() {
        let ring = HashRing::new("a");
        ring.set_members(vec!["a".to_string()]);

        for key in keys(64) {
            assert_eq!(ring.owns(&key), Ok(true));
        }
    }

    #[test]
    fn test_every_key_has_exactly_one_owner() {
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rings: Vec<HashRing> = members
            .iter()
            .map(|m| {
                let ring = HashRing::new(m.clone());
                ring.set_members(members.clone());
                ring
            })
            .collect();

        for key in keys(256) {
            let owners: usize = rings
                .iter()
                .map(|r| r.owns(&key).unwrap() as usize)
                .sum();
            assert_eq!(owners, 1, "key {key} must have exactly one owner");
        }
    }

    #[test]
    fn test_ownership_is_spread() {
        let members = vec!["a".to_string(), "b".to_string()];
        let ring_a = HashRing::new("a");
        ring_a.set_members(members.clone());
        let ring_b = HashRing::new("b");
        ring_b.set_members(members);

        let owned_a = keys(256).iter().filter(|k| ring_a.owns(k).unwrap()).count();
        let owned_b = keys(256).iter().filter(|k| ring_b.owns(k).unwrap()).count();

        assert!(owned_a > 0, "replica a owns nothing");
        assert!(owned_b > 0, "replica b owns nothing");
        assert_eq!(owned_a + owned_b, 256);
    }

    #[test]
    fn test_keys_stable_across_unrelated_membership_change() {
        let ring = HashRing::new("a");
        ring.set_members(vec!["a".to_string(), "b".to_string()]);

        let before: Vec<String> = keys(256)
            .into_iter()
            .filter(|k| ring.owns(k).unwrap())
            .collect();

        // Adding a member must never move a key between the existing members;
        // it may only steal keys for the new member.
        ring.set_members(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        for key in &before {
            let owner = ring.owner_of(key).unwrap();
            assert!(
                owner == "a" || owner == "c",
                "key {key} moved from a to {owner}"
            );
        }
    }

    #[test]
    fn test_duplicate_members_collapse() {
        let ring = HashRing::new("a");
        ring.set_members(vec!["a".to_string(), "a".to_string(), "b".to_string()]);
        assert_eq!(ring.members(), vec!["a".to_string(), "b".to_string()]);
    }
}
