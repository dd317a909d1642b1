//! The commit/reveal store.
//!
//! The server publishes `keccak256(secret)` (the commit) in every invoice
//! and only reveals `secret` when redeeming a winning ticket, so the winner
//! predicate cannot be steered after a ticket was issued. Rotation retires
//! the previous commit rather than deleting it: tickets already in flight
//! against it stay redeemable for a grace window.

use std::collections::HashMap;

use alloy_primitives::{keccak256, B256};
use rand::Rng as _;

use crate::error::LedgerError;

/// How long a retiring commit stays redeemable past its expiry mark.
pub const RETIRE_RETENTION_SECS: u64 = 60;

/// Expiry mark of the single active entry.
const ACTIVE: u64 = 0;

#[derive(Debug, Clone)]
struct Reveal {
    secret: B256,
    /// 0 while active; the rotation timestamp once retiring.
    expire: u64,
}

/// Bounded set of server-chosen secrets keyed by their commit hash.
///
/// Exactly one entry is active at any time; the rest are retiring and are
/// garbage-collected opportunistically once their retention window lapses.
#[derive(Debug)]
pub struct CommitStore {
    reveals: HashMap<B256, Reveal>,
    active: B256,
}

impl CommitStore {
    /// Creates a store with a fresh random active commit.
    pub fn new(now: u64) -> Self {
        Self::with_secret(random_secret(), now)
    }

    /// Creates a store with a caller-chosen initial secret.
    ///
    /// Deterministic secrets make the lottery draw reproducible, which test
    /// harnesses rely on.
    pub fn with_secret(secret: B256, now: u64) -> Self {
        let mut store = Self {
            reveals: HashMap::new(),
            active: B256::ZERO,
        };
        store.rotate_with(secret, now);
        store
    }

    /// The commit reported in invoices.
    pub fn active_commit(&self) -> B256 {
        self.active
    }

    /// Retires the current commit and installs a fresh random one.
    pub fn rotate(&mut self, now: u64) {
        self.rotate_with(random_secret(), now);
    }

    /// Retires the current commit and installs `secret` as the new active
    /// one.
    pub fn rotate_with(&mut self, secret: B256, now: u64) {
        if let Some(previous) = self.reveals.get_mut(&self.active) {
            previous.expire = now;
        }
        let commit = keccak256(secret);
        self.reveals.insert(commit, Reveal { secret, expire: ACTIVE });
        self.active = commit;
        self.collect(now);
    }

    /// Returns the secret behind `commit` if it is active or still within
    /// its retention window.
    pub fn lookup(&mut self, commit: B256, now: u64) -> Result<B256, LedgerError> {
        self.collect(now);
        match self.reveals.get(&commit) {
            Some(reveal) if reveal.expire == ACTIVE || now <= reveal.expire + RETIRE_RETENTION_SECS => {
                Ok(reveal.secret)
            }
            _ => Err(LedgerError::UnknownCommit),
        }
    }

    /// Number of retained entries, the active one included.
    pub fn len(&self) -> usize {
        self.reveals.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.reveals.is_empty()
    }

    fn collect(&mut self, now: u64) {
        self.reveals
            .retain(|_, reveal| reveal.expire == ACTIVE || now <= reveal.expire + RETIRE_RETENTION_SECS);
    }
}

fn random_secret() -> B256 {
    let mut secret = [0u8; 32];
    rand::rng().fill(&mut secret[..]);
    B256::from(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_commit_matches_secret() {
        let secret = B256::repeat_byte(0x01);
        let store = CommitStore::with_secret(secret, 100);
        assert_eq!(store.active_commit(), keccak256(secret));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lookup_active() {
        let secret = B256::repeat_byte(0x01);
        let mut store = CommitStore::with_secret(secret, 100);
        let commit = store.active_commit();
        assert_eq!(store.lookup(commit, 100), Ok(secret));
    }

    #[test]
    fn lookup_unknown() {
        let mut store = CommitStore::new(100);
        assert_eq!(
            store.lookup(B256::repeat_byte(0xFF), 100),
            Err(LedgerError::UnknownCommit),
        );
    }

    #[test]
    fn rotation_retires_previous() {
        let old_secret = B256::repeat_byte(0x01);
        let mut store = CommitStore::with_secret(old_secret, 100);
        let old_commit = store.active_commit();

        store.rotate_with(B256::repeat_byte(0x02), 200);
        assert_ne!(store.active_commit(), old_commit);
        assert_eq!(store.len(), 2);

        // Still redeemable within retention.
        assert_eq!(store.lookup(old_commit, 200), Ok(old_secret));
    }

    #[test]
    fn retention_boundary() {
        let secret = B256::repeat_byte(0x01);
        let mut store = CommitStore::with_secret(secret, 100);
        let commit = store.active_commit();
        store.rotate_with(B256::repeat_byte(0x02), 200);

        // expire + 60 == now is still accepted...
        assert_eq!(store.lookup(commit, 200 + RETIRE_RETENTION_SECS), Ok(secret));
        // ...one second past is not.
        assert_eq!(
            store.lookup(commit, 200 + RETIRE_RETENTION_SECS + 1),
            Err(LedgerError::UnknownCommit),
        );
    }

    #[test]
    fn expired_entries_are_collected() {
        let mut store = CommitStore::with_secret(B256::repeat_byte(0x01), 100);
        store.rotate_with(B256::repeat_byte(0x02), 200);
        store.rotate_with(B256::repeat_byte(0x03), 201);
        assert_eq!(store.len(), 3);

        // Touching the store far in the future drops every retiring entry.
        let _ = store.lookup(store.active_commit(), 1000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn bounded_by_recent_rotations() {
        let mut store = CommitStore::new(0);
        for round in 0..100u64 {
            store.rotate_with(B256::repeat_byte(round as u8), round * 10);
        }
        // Only rotations inside the last retention window survive.
        assert!(store.len() <= 1 + (RETIRE_RETENTION_SECS / 10) as usize + 1);
    }
}
