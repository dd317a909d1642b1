//! Connection core of the Tollgate egress node.
//!
//! A [`Server`] is the per-peer instance: it owns the payment ledger, the
//! egress handle, and the oracle handle, and it accepts WebRTC sessions
//! whose data channels feed the billing pipeline. Inbound tunnel packets
//! are billed, demultiplexed into either the control protocol (ticket
//! submission, invoicing) or plain IP forwarding, and the other direction
//! is forwarded back subject to the client's remaining balance.

mod config;
mod egress;
mod error;
mod evaluator;
mod nest;
mod sdp;
mod server;
mod session;

pub use config::ServerConfig;
pub use egress::{Egress, EgressError};
pub use error::ServerError;
pub use nest::Nest;
pub use sdp::filter_answer;
pub use server::{LedgerStats, Server};
pub use session::Session;

use async_trait::async_trait;
use bytes::Bytes;

/// A bidirectional reliable datagram channel to the peer.
///
/// Produced by the transport after the offer/answer exchange; the pipeline
/// only ever sends on it.
#[async_trait]
pub trait DatagramLink: Send + Sync {
    /// Sends one ciphertext datagram to the peer.
    async fn send(&self, data: Bytes) -> Result<(), ServerError>;
}
