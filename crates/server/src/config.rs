//! Server configuration.

use alloy_primitives::{B256, U256};
use webrtc::peer_connection::certificate::RTCCertificate;

/// Configuration of a per-peer server instance.
#[derive(Clone)]
pub struct ServerConfig {
    /// Size of the replay window over `(issued, nonce, signer)` triples.
    pub horizon: usize,
    /// The balance floor is the price of this many bytes; a forced charge
    /// below `-price(floor_bytes)` terminates the session.
    pub floor_bytes: u64,
    /// Gas budget for redemption transactions.
    pub gas_budget: U256,
    /// STUN/TURN server URLs offered during ICE negotiation.
    pub ice_servers: Vec<String>,
    /// Long-lived DTLS certificates identifying this server. Empty means a
    /// per-session ephemeral certificate.
    pub certificates: Vec<RTCCertificate>,
    /// Deterministic initial commit secret. `None` draws a random one;
    /// fixing it makes the lottery reproducible for harnesses.
    pub commit_secret: Option<B256>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            horizon: 32,
            floor_bytes: 128 * 1024,
            gas_budget: U256::from(100_000u64),
            ice_servers: Vec::new(),
            certificates: Vec::new(),
            commit_secret: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("horizon", &self.horizon)
            .field("floor_bytes", &self.floor_bytes)
            .field("gas_budget", &self.gas_budget)
            .field("ice_servers", &self.ice_servers)
            .field("certificates", &self.certificates.len())
            .field("commit_secret", &self.commit_secret.is_some())
            .finish()
    }
}
