//! Per-session payment accounting.
//!
//! Everything in this crate is synchronous and intended to live behind a
//! single mutex per session: the [`Ledger`] owns the balance, the invoice
//! serial, the [`CommitStore`] of revealable secrets, the [`NonceHorizon`]
//! replay window, and the set of pending expected credits. No method here
//! performs I/O, so the guarding lock is never held across a suspension
//! point.

mod commit;
mod error;
mod horizon;
mod ledger;

pub use commit::{CommitStore, RETIRE_RETENTION_SECS};
pub use error::LedgerError;
pub use horizon::NonceHorizon;
pub use ledger::{Ledger, LedgerSnapshot, TicketAdmission};
