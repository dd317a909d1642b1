//! The control datagram protocol.
//!
//! Control datagrams are UDP payloads addressed to [`CONTROL_PORT`] inside
//! the tunnel. Each carries a header followed by zero or more
//! length-prefixed command frames:
//!
//! ```text
//! Header  := Magic(4) ‖ Id(32)
//! Frame   := Len(2) ‖ Tag(4) ‖ Payload
//! ```
//!
//! Scanning is strict about framing but lenient about individual commands:
//! a frame that fails to decode is skipped and scanning continues, so one
//! corrupt command cannot suppress its siblings.

use alloy_primitives::{Address, B256, I256, U256};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::ticket::Ticket;

/// Identifies control datagrams; anything else at the control port is
/// dropped.
pub const MAGIC: u32 = u32::from_be_bytes(*b"TOLL");

/// The reserved in-tunnel UDP port consumed by the server.
pub const CONTROL_PORT: u16 = u16::from_be_bytes(*b"TG");

/// Tag of a [`Command::Stamp`].
pub const TAG_STAMP: u32 = u32::from_be_bytes(*b"STMP");
/// Tag of a [`Command::Invoice`].
pub const TAG_INVOICE: u32 = u32::from_be_bytes(*b"INVC");
/// Tag of a [`Command::Submit`].
pub const TAG_SUBMIT: u32 = u32::from_be_bytes(*b"SUBM");

const HEADER_LEN: usize = 4 + 32;

/// The control datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Client-chosen correlation id, echoed in replies.
    pub id: B256,
}

impl Header {
    /// Decodes the header, returning it and the remaining command region.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::MalformedPacket("short header"));
        }
        let mut cursor = buf;
        let magic = cursor.get_u32();
        if magic != MAGIC {
            return Err(WireError::MalformedPacket("bad magic"));
        }
        let mut id = [0u8; 32];
        cursor.copy_to_slice(&mut id);
        Ok((Self { id: B256::from(id) }, &buf[HEADER_LEN..]))
    }
}

/// An invoice: the server's authoritative statement of the client's credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// Monotonic ledger serial; lets clients discard stale invoices.
    pub serial: u64,
    /// Balance plus pending expected credits. Signed, wire-encoded as a
    /// 256-bit two's complement.
    pub balance: I256,
    /// Lottery contract the server redeems against.
    pub lottery: Address,
    /// Chain id of the lottery contract.
    pub chain: U256,
    /// Account the server collects to.
    pub recipient: Address,
    /// The currently active commit; new tickets must reference it.
    pub commit: B256,
}

/// A single control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Monotonic microsecond timestamp; orders invoices on the client side.
    Stamp(u64),
    /// Server -> client balance statement.
    Invoice(Invoice),
    /// Client -> server ticket submission.
    Submit(Ticket),
}

impl Command {
    fn tag(&self) -> u32 {
        match self {
            Command::Stamp(_) => TAG_STAMP,
            Command::Invoice(_) => TAG_INVOICE,
            Command::Submit(_) => TAG_SUBMIT,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Command::Stamp(monotonic) => buf.put_u64(*monotonic),
            Command::Invoice(invoice) => {
                buf.put_u64(invoice.serial);
                buf.put_slice(&invoice.balance.into_raw().to_be_bytes::<32>());
                buf.put_slice(invoice.lottery.as_slice());
                buf.put_slice(&invoice.chain.to_be_bytes::<32>());
                buf.put_slice(invoice.recipient.as_slice());
                buf.put_slice(invoice.commit.as_slice());
            }
            Command::Submit(ticket) => buf.put_slice(&ticket.encode()),
        }
    }

    fn decode(tag: u32, mut payload: &[u8]) -> Result<Self, WireError> {
        match tag {
            TAG_STAMP => {
                if payload.len() != 8 {
                    return Err(WireError::MalformedPacket("stamp length"));
                }
                Ok(Command::Stamp(payload.get_u64()))
            }
            TAG_INVOICE => {
                if payload.len() != 8 + 32 + 20 + 32 + 20 + 32 {
                    return Err(WireError::MalformedPacket("invoice length"));
                }
                let serial = payload.get_u64();
                let balance = I256::from_raw(take_u256(&mut payload));
                let lottery = take_address(&mut payload);
                let chain = take_u256(&mut payload);
                let recipient = take_address(&mut payload);
                let commit = take_b256(&mut payload);
                Ok(Command::Invoice(Invoice {
                    serial,
                    balance,
                    lottery,
                    chain,
                    recipient,
                    commit,
                }))
            }
            TAG_SUBMIT => Ok(Command::Submit(Ticket::decode(payload)?)),
            _ => Err(WireError::MalformedPacket("unknown tag")),
        }
    }
}

/// Encodes a control payload: header followed by one frame per command.
pub fn encode_control(id: B256, commands: &[Command]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + commands.len() * 64);
    buf.put_u32(MAGIC);
    buf.put_slice(id.as_slice());
    for command in commands {
        let mut body = BytesMut::new();
        body.put_u32(command.tag());
        command.encode_payload(&mut body);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
    }
    buf.freeze()
}

/// Iterates the command frames following a header.
///
/// Yields `Err` for frames that fail to decode (the caller skips them) and
/// stops entirely when the framing itself is broken.
pub fn scan(region: &[u8]) -> Scan<'_> {
    Scan { region }
}

/// Iterator over command frames; see [`scan`].
pub struct Scan<'a> {
    region: &'a [u8],
}

impl Iterator for Scan<'_> {
    type Item = Result<Command, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.region.is_empty() {
            return None;
        }
        if self.region.len() < 2 {
            self.region = &[];
            return Some(Err(WireError::MalformedPacket("short frame length")));
        }
        let len = u16::from_be_bytes([self.region[0], self.region[1]]) as usize;
        let rest = &self.region[2..];
        if rest.len() < len {
            self.region = &[];
            return Some(Err(WireError::MalformedPacket("frame overruns datagram")));
        }
        let frame = &rest[..len];
        self.region = &rest[len..];

        if frame.len() < 4 {
            return Some(Err(WireError::MalformedPacket("short frame")));
        }
        let tag = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        Some(Command::decode(tag, &frame[4..]))
    }
}

fn take_b256(buf: &mut &[u8]) -> B256 {
    let mut out = [0u8; 32];
    buf.copy_to_slice(&mut out);
    B256::from(out)
}

fn take_u256(buf: &mut &[u8]) -> U256 {
    U256::from_be_bytes(take_b256(buf).0)
}

fn take_address(buf: &mut &[u8]) -> Address {
    let mut out = [0u8; 20];
    buf.copy_to_slice(&mut out);
    Address::from(out)
}
