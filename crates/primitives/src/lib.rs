//! Wire-level primitives for the Tollgate egress node.
//!
//! This crate defines everything that crosses the tunnel in fixed binary
//! form and nothing that holds state:
//!
//! - [`Ticket`] - the probabilistic payment ticket, its codec, its hash and
//!   signer recovery
//! - [`protocol`] - the control datagram layout (header, `Stamp` / `Invoice` /
//!   `Submit` commands, strict frame scanning)
//! - [`datagram`] - parsing and building of the inner IPv4/UDP datagrams that
//!   carry the control protocol through the tunnel
//!
//! All multi-byte integers on the wire are big-endian.

mod datagram;
mod error;
pub mod protocol;
mod ticket;

pub use datagram::{build_udp, classify, Flow, UdpDatagram};
pub use error::WireError;
pub use protocol::{Command, Header, Invoice, CONTROL_PORT, MAGIC};
pub use ticket::{grab_domain, lottery_draw, Ticket};
