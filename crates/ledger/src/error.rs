//! Accounting errors.

/// Reasons a ticket is refused by the ledger. Each drops only the offending
/// command; the session continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The `(issued, nonce, signer)` triple is already inside the replay
    /// window.
    #[error("replayed nonce")]
    ReplayedNonce,

    /// The ticket's `issued` timestamp fell behind the horizon floor.
    #[error("issued timestamp below horizon floor")]
    StaleIssued,

    /// The referenced commit is neither active nor within its retention
    /// window.
    #[error("unknown or expired commit")]
    UnknownCommit,

    /// The ticket hash is already pending an on-chain validity check.
    #[error("ticket already pending")]
    DuplicateTicket,
}
