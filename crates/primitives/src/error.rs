//! Wire decoding errors.

/// Errors produced while decoding tunnel traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The outer framing (header, command frame, inner datagram) is invalid.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A `Submit` payload does not decode to a well-formed ticket.
    #[error("malformed ticket: {0}")]
    MalformedTicket(&'static str),

    /// ECDSA public key recovery failed for a ticket signature.
    #[error("ticket signature recovery failed")]
    Recovery,
}
