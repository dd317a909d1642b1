//! The accounting ledger.
//!
//! One [`Ledger`] per session, guarded by the session's mutex. The balance
//! is a signed 256-bit amount in on-chain token units; it may run negative
//! down to a floor the server derives from its byte pricing. Every
//! balance-affecting event bumps the `serial`, which invoices echo so
//! clients can deduplicate them.

use std::collections::HashMap;

use alloy_primitives::{Address, B256, I256, U256};

use tollgate_primitives::lottery_draw;

use crate::commit::CommitStore;
use crate::error::LedgerError;
use crate::horizon::NonceHorizon;

/// Result of admitting a ticket into the ledger's critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketAdmission {
    /// The secret behind the commit the ticket referenced.
    pub reveal: B256,
    /// Whether the lottery draw came in at or below the ticket's ratio.
    pub winner: bool,
}

/// Invoice-facing view of the ledger at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Serial at snapshot time.
    pub serial: u64,
    /// Balance plus the sum of pending expected credits.
    pub balance: I256,
    /// The active commit.
    pub commit: B256,
}

/// Per-session payment state.
#[derive(Debug)]
pub struct Ledger {
    balance: I256,
    serial: u64,
    commits: CommitStore,
    nonces: NonceHorizon,
    expected: HashMap<B256, I256>,
    exhausted: bool,
}

impl Ledger {
    /// Creates a ledger with a random initial commit secret.
    pub fn new(horizon: usize, now: u64) -> Self {
        Self::with_commit_secret(horizon, None, now)
    }

    /// Creates a ledger, optionally with a deterministic initial commit
    /// secret.
    pub fn with_commit_secret(horizon: usize, secret: Option<B256>, now: u64) -> Self {
        let commits = match secret {
            Some(secret) => CommitStore::with_secret(secret, now),
            None => CommitStore::new(now),
        };
        Self {
            balance: I256::ZERO,
            serial: 0,
            commits,
            nonces: NonceHorizon::new(horizon),
            expected: HashMap::new(),
            exhausted: false,
        }
    }

    /// Charges `price` against the balance.
    ///
    /// Without `force`, a pre-balance below the price refuses the charge
    /// outright: nothing is decremented and the serial does not move, the
    /// caller just drops the packet. A forced charge always lands; if it
    /// drives the balance below `-floor` the ledger latches the exhausted
    /// flag and the caller must tear the session down.
    pub fn bill(&mut self, price: U256, floor: U256, force: bool) -> bool {
        let price = I256::from_raw(price);
        if !force && self.balance < price {
            return false;
        }

        self.balance -= price;
        self.serial += 1;

        if self.balance < -I256::from_raw(floor) {
            self.exhausted = true;
            return false;
        }
        true
    }

    /// Whether a forced charge has driven the balance through the floor.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Admits a submitted ticket: replay window, commit lookup, pending
    /// credit, winner draw, and commit rotation, all in one critical
    /// section.
    ///
    /// A win against the active commit rotates it immediately so that no
    /// further tickets can be issued against a secret the server is about
    /// to reveal on-chain. Wins against retiring commits do not rotate.
    pub fn admit_ticket(
        &mut self,
        ticket_hash: B256,
        commit: B256,
        issued: U256,
        nonce: B256,
        signer: Address,
        ratio: u128,
        expected_value: I256,
        now: u64,
    ) -> Result<TicketAdmission, LedgerError> {
        self.nonces.insert(issued, nonce, signer)?;
        let reveal = self.commits.lookup(commit, now)?;
        self.admit_expected(ticket_hash, expected_value)?;

        let winner = lottery_draw(reveal, issued, nonce) <= ratio;
        if winner && self.commits.active_commit() == commit {
            self.commits.rotate(now);
        }
        Ok(TicketAdmission { reveal, winner })
    }

    /// Records the expected-value contribution of a ticket whose on-chain
    /// validity check is in flight.
    pub fn admit_expected(&mut self, ticket_hash: B256, value: I256) -> Result<(), LedgerError> {
        if self.expected.contains_key(&ticket_hash) {
            return Err(LedgerError::DuplicateTicket);
        }
        self.expected.insert(ticket_hash, value);
        self.serial += 1;
        Ok(())
    }

    /// Resolves a pending ticket once the validity check lands. Credits the
    /// balance when the check passed; always removes the entry and bumps
    /// the serial so the resolution is invoice-visible either way.
    pub fn resolve_expected(&mut self, ticket_hash: B256, credited: bool) -> bool {
        let Some(value) = self.expected.remove(&ticket_hash) else {
            return false;
        };
        if credited {
            self.balance += value;
        }
        self.serial += 1;
        true
    }

    /// Snapshot for invoice emission: serial, balance plus pending credits,
    /// and the active commit.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let pending: I256 = self.expected.values().copied().fold(I256::ZERO, |acc, v| acc + v);
        LedgerSnapshot {
            serial: self.serial,
            balance: self.balance + pending,
            commit: self.commits.active_commit(),
        }
    }

    /// Current serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Balance without pending credits.
    pub fn balance(&self) -> I256 {
        self.balance
    }

    /// Number of tickets pending resolution.
    pub fn pending(&self) -> usize {
        self.expected.len()
    }

    /// The replay window.
    pub fn nonces(&self) -> &NonceHorizon {
        &self.nonces
    }

    /// The commit/reveal store.
    pub fn commits(&self) -> &CommitStore {
        &self.commits
    }

    /// Mutable access to the commit/reveal store.
    pub fn commits_mut(&mut self) -> &mut CommitStore {
        &mut self.commits
    }
}
