//! The egress seam.
//!
//! The actual egress network stack (a raw IP socket bound to the exit
//! interface) lives outside the core; the pipeline only needs to push
//! authorized packets into it and to shut it down with the session.

use async_trait::async_trait;
use bytes::Bytes;

/// Failure pushing a packet out of the exit interface.
#[derive(Debug, Clone, thiserror::Error)]
#[error("egress failed: {0}")]
pub struct EgressError(pub String);

/// A raw IP packet sink toward the public internet.
///
/// Shared across sessions; forwarding contention is resolved by the
/// implementation's own queueing.
#[async_trait]
pub trait Egress: Send + Sync {
    /// Forwards one IP packet.
    async fn send(&self, packet: Bytes) -> Result<(), EgressError>;

    /// Releases the egress resources during graceful shutdown.
    async fn shut(&self) -> Result<(), EgressError> {
        Ok(())
    }
}
