//! Bounded replay-prevention window.
//!
//! The horizon keeps the `(issued, nonce, signer)` triples of recently
//! accepted tickets in an ordered set of bounded size. When the set
//! overflows, the lexicographically smallest entry is evicted and the
//! acceptance floor advances past its `issued` timestamp, so evicted
//! triples cannot be replayed either: they are now simply too old.

use std::collections::BTreeSet;

use alloy_primitives::{Address, B256, U256};

use crate::error::LedgerError;

/// Sliding replay window over accepted ticket triples.
#[derive(Debug)]
pub struct NonceHorizon {
    horizon: usize,
    floor: U256,
    entries: BTreeSet<(U256, B256, Address)>,
}

impl NonceHorizon {
    /// Creates a window admitting at most `horizon` triples.
    pub fn new(horizon: usize) -> Self {
        Self {
            horizon,
            floor: U256::ZERO,
            entries: BTreeSet::new(),
        }
    }

    /// Admits a triple, evicting the oldest entries past the window bound.
    pub fn insert(
        &mut self,
        issued: U256,
        nonce: B256,
        signer: Address,
    ) -> Result<(), LedgerError> {
        if issued < self.floor {
            return Err(LedgerError::StaleIssued);
        }
        if !self.entries.insert((issued, nonce, signer)) {
            return Err(LedgerError::ReplayedNonce);
        }
        while self.entries.len() > self.horizon {
            let Some(oldest) = self.entries.pop_first() else {
                break;
            };
            self.floor = oldest.0.saturating_add(U256::from(1u8));
        }
        Ok(())
    }

    /// The monotonically non-decreasing lower bound on acceptable `issued`
    /// timestamps.
    pub fn issued_floor(&self) -> U256 {
        self.floor
    }

    /// Number of triples currently retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
