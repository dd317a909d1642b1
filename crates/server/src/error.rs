//! Server error taxonomy.
//!
//! Per-command errors (`WrongLottery`, `ExpiredTicket`, the ledger
//! refusals, ticket decode failures) drop only the offending command; the
//! submit loop catches them so sibling commands and the closing invoice
//! still go out. `BalanceExhausted` and transport failures terminate the
//! session.

use tollgate_chain::OracleError;
use tollgate_ledger::LedgerError;
use tollgate_primitives::WireError;

use crate::egress::EgressError;

/// Errors raised by the connection core.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Framing or ticket decode failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The ledger refused the ticket.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The ticket names a `(lottery, chain, recipient)` tuple this server
    /// does not collect through.
    #[error("ticket names a foreign lottery")]
    WrongLottery,

    /// The ticket's validity window has already ended.
    #[error("ticket validity window has ended")]
    ExpiredTicket,

    /// An oracle RPC failed.
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// The egress interface refused a packet.
    #[error(transparent)]
    Egress(#[from] EgressError),

    /// The client's balance fell through the floor.
    #[error("balance exhausted")]
    BalanceExhausted,

    /// The peer transport failed or closed.
    #[error("transport failed: {0}")]
    Transport(String),
}
