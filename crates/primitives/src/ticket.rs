//! The probabilistic payment ticket.
//!
//! A ticket is a signed commitment by a funding account: "if the server's
//! revealed secret draws at or below `ratio`, the on-chain lottery pays
//! `face_amount` to `recipient`". Tickets are exchanged off-chain inside
//! `Submit` commands and redeemed on-chain only when they win.
//!
//! # Hashing and signing
//!
//! The ticket hash is the keccak256 of the ABI encoding of a domain
//! separator followed by every field in wire order. The signed digest is the
//! EIP-191 personal-message hash of the ticket hash, and the signer is
//! recovered from `(v, r, s)` via secp256k1 ECDSA recovery.

use std::sync::LazyLock;

use alloy_primitives::{
    eip191_hash_message, keccak256, Address, Bytes, Signature, B256, U256,
};
use alloy_sol_types::SolValue;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::WireError;

/// Size of the fixed-width prefix of an encoded ticket, excluding the
/// length-prefixed receipt blob.
const FIXED_LEN: usize = 1 + 32 + 32 + 32 + 32 + 32 + 20 + 32 + 16 + 16 + 32 + 16 + 20 + 20;

static GRAB_DOMAIN: LazyLock<B256> = LazyLock::new(|| keccak256("Tollgate.grab"));

/// Domain separator binding ticket hashes to the on-chain `grab` redemption
/// method.
pub fn grab_domain() -> B256 {
    *GRAB_DOMAIN
}

/// A decoded payment ticket. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Recovery id of the funder's signature (0/1 or 27/28).
    pub v: u8,
    /// Signature `r` scalar.
    pub r: B256,
    /// Signature `s` scalar.
    pub s: B256,
    /// The server commit this ticket was issued against.
    pub commit: B256,
    /// Issuance timestamp, seconds.
    pub issued: U256,
    /// Client-chosen nonce making the lottery draw unique.
    pub nonce: B256,
    /// Lottery contract address.
    pub lottery: Address,
    /// Chain id of the lottery contract.
    pub chain: U256,
    /// Full payout if the ticket wins.
    pub face_amount: u128,
    /// Win probability as a fraction of `2^128`.
    pub ratio: u128,
    /// Start of the validity window, seconds.
    pub start: U256,
    /// Length of the validity window, seconds.
    pub range: u128,
    /// Account the payout is drawn from.
    pub funder: Address,
    /// Account the payout is sent to.
    pub recipient: Address,
    /// Opaque receipt presented to the funder check.
    pub receipt: Bytes,
}

impl Ticket {
    /// Decodes a ticket from a `Submit` command payload.
    ///
    /// Parsing is strict: short input, overlong input, and receipts whose
    /// length prefix disagrees with the buffer all fail.
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < FIXED_LEN + 2 {
            return Err(WireError::MalformedTicket("short input"));
        }

        let v = buf.get_u8();
        let r = get_b256(&mut buf);
        let s = get_b256(&mut buf);
        let commit = get_b256(&mut buf);
        let issued = get_u256(&mut buf);
        let nonce = get_b256(&mut buf);
        let lottery = get_address(&mut buf);
        let chain = get_u256(&mut buf);
        let face_amount = buf.get_u128();
        let ratio = buf.get_u128();
        let start = get_u256(&mut buf);
        let range = buf.get_u128();
        let funder = get_address(&mut buf);
        let recipient = get_address(&mut buf);

        let receipt_len = buf.get_u16() as usize;
        if buf.remaining() < receipt_len {
            return Err(WireError::MalformedTicket("truncated receipt"));
        }
        let receipt = Bytes::from(buf[..receipt_len].to_vec());
        buf.advance(receipt_len);
        if buf.has_remaining() {
            return Err(WireError::MalformedTicket("trailing bytes"));
        }

        Ok(Self {
            v,
            r,
            s,
            commit,
            issued,
            nonce,
            lottery,
            chain,
            face_amount,
            ratio,
            start,
            range,
            funder,
            recipient,
            receipt,
        })
    }

    /// Encodes the ticket as a `Submit` command payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_LEN + 2 + self.receipt.len());
        buf.put_u8(self.v);
        buf.put_slice(self.r.as_slice());
        buf.put_slice(self.s.as_slice());
        buf.put_slice(self.commit.as_slice());
        buf.put_slice(&self.issued.to_be_bytes::<32>());
        buf.put_slice(self.nonce.as_slice());
        buf.put_slice(self.lottery.as_slice());
        buf.put_slice(&self.chain.to_be_bytes::<32>());
        buf.put_u128(self.face_amount);
        buf.put_u128(self.ratio);
        buf.put_slice(&self.start.to_be_bytes::<32>());
        buf.put_u128(self.range);
        buf.put_slice(self.funder.as_slice());
        buf.put_slice(self.recipient.as_slice());
        buf.put_u16(self.receipt.len() as u16);
        buf.put_slice(&self.receipt);
        buf.freeze()
    }

    /// The keccak256 hash covering the domain separator and every signed
    /// field in fixed order.
    pub fn ticket_hash(&self) -> B256 {
        let preimage = (
            grab_domain(),
            self.commit,
            self.issued,
            self.nonce,
            self.lottery,
            self.chain,
            self.face_amount,
            self.ratio,
            self.start,
            self.range,
            self.funder,
            self.recipient,
            self.receipt.clone(),
        )
            .abi_encode();
        keccak256(preimage)
    }

    /// Recovers the funding account that signed this ticket.
    pub fn recover_signer(&self) -> Result<Address, WireError> {
        let parity = match self.v {
            0 | 27 => false,
            1 | 28 => true,
            _ => return Err(WireError::MalformedTicket("recovery id")),
        };
        let signature = Signature::new(
            U256::from_be_bytes(self.r.0),
            U256::from_be_bytes(self.s.0),
            parity,
        );
        let digest = eip191_hash_message(self.ticket_hash());
        signature
            .recover_address_from_prehash(&digest)
            .map_err(|_| WireError::Recovery)
    }

    /// End of the validity window.
    pub fn until(&self) -> U256 {
        self.start.saturating_add(U256::from(self.range))
    }

    /// Whether this ticket wins against the given revealed secret.
    pub fn wins(&self, reveal: B256) -> bool {
        lottery_draw(reveal, self.issued, self.nonce) <= self.ratio
    }
}

/// The lottery draw: the low 128 bits of `keccak256(reveal ‖ issued ‖ nonce)`.
///
/// A ticket wins when the draw is at or below its `ratio`.
pub fn lottery_draw(reveal: B256, issued: U256, nonce: B256) -> u128 {
    let mut preimage = [0u8; 96];
    preimage[..32].copy_from_slice(reveal.as_slice());
    preimage[32..64].copy_from_slice(&issued.to_be_bytes::<32>());
    preimage[64..].copy_from_slice(nonce.as_slice());
    let digest = keccak256(preimage);

    let mut low = [0u8; 16];
    low.copy_from_slice(&digest[16..]);
    u128::from_be_bytes(low)
}

fn get_b256(buf: &mut &[u8]) -> B256 {
    let mut out = [0u8; 32];
    buf.copy_to_slice(&mut out);
    B256::from(out)
}

fn get_u256(buf: &mut &[u8]) -> U256 {
    U256::from_be_bytes(get_b256(buf).0)
}

fn get_address(buf: &mut &[u8]) -> Address {
    let mut out = [0u8; 20];
    buf.copy_to_slice(&mut out);
    Address::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn test_ticket() -> Ticket {
        Ticket {
            v: 27,
            r: B256::repeat_byte(0x11),
            s: B256::repeat_byte(0x22),
            commit: B256::repeat_byte(0x33),
            issued: U256::from(1_700_000_000u64),
            nonce: B256::repeat_byte(0x44),
            lottery: Address::repeat_byte(0x55),
            chain: U256::from(1u64),
            face_amount: 2_000_000_000_000_000_000u128,
            ratio: u128::MAX / 2,
            start: U256::from(1_700_000_000u64),
            range: 86_400,
            funder: Address::repeat_byte(0x66),
            recipient: Address::repeat_byte(0x77),
            receipt: Bytes::from_static(b"receipt"),
        }
    }

    /// Signs the ticket's digest with `signer`, filling in `(v, r, s)`.
    pub(crate) fn sign_ticket(ticket: &mut Ticket, signer: &PrivateKeySigner) {
        let digest = eip191_hash_message(ticket.ticket_hash());
        let signature = signer.sign_hash_sync(&digest).unwrap();
        ticket.v = if signature.v() { 28 } else { 27 };
        ticket.r = B256::from(signature.r());
        ticket.s = B256::from(signature.s());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ticket = test_ticket();
        let encoded = ticket.encode();
        let decoded = Ticket::decode(&encoded).unwrap();
        assert_eq!(ticket, decoded);
    }

    #[test]
    fn roundtrip_empty_receipt() {
        let mut ticket = test_ticket();
        ticket.receipt = Bytes::new();
        let decoded = Ticket::decode(&ticket.encode()).unwrap();
        assert_eq!(ticket, decoded);
    }

    #[test]
    fn decode_rejects_short_input() {
        let encoded = test_ticket().encode();
        assert_eq!(
            Ticket::decode(&encoded[..encoded.len() - 1]),
            Err(WireError::MalformedTicket("truncated receipt")),
        );
        assert_eq!(
            Ticket::decode(&encoded[..10]),
            Err(WireError::MalformedTicket("short input")),
        );
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut encoded = test_ticket().encode().to_vec();
        encoded.push(0);
        assert_eq!(
            Ticket::decode(&encoded),
            Err(WireError::MalformedTicket("trailing bytes")),
        );
    }

    #[test]
    fn hash_is_deterministic_and_field_sensitive() {
        let ticket = test_ticket();
        assert_eq!(ticket.ticket_hash(), ticket.ticket_hash());

        let mut other = ticket.clone();
        other.nonce = B256::repeat_byte(0x45);
        assert_ne!(ticket.ticket_hash(), other.ticket_hash());
    }

    #[test]
    fn sign_and_recover() {
        let signer = PrivateKeySigner::random();
        let mut ticket = test_ticket();
        sign_ticket(&mut ticket, &signer);

        assert_eq!(ticket.recover_signer().unwrap(), signer.address());
    }

    #[test]
    fn recover_survives_codec_roundtrip() {
        let signer = PrivateKeySigner::random();
        let mut ticket = test_ticket();
        sign_ticket(&mut ticket, &signer);

        let decoded = Ticket::decode(&ticket.encode()).unwrap();
        assert_eq!(decoded.recover_signer().unwrap(), signer.address());
    }

    #[test]
    fn recover_rejects_bad_recovery_id() {
        let mut ticket = test_ticket();
        ticket.v = 5;
        assert_eq!(
            ticket.recover_signer(),
            Err(WireError::MalformedTicket("recovery id")),
        );
    }

    #[test]
    fn draw_extremes() {
        let reveal = B256::repeat_byte(0xAB);
        let issued = U256::from(123u64);
        let nonce = B256::repeat_byte(0xCD);
        let draw = lottery_draw(reveal, issued, nonce);

        let mut ticket = test_ticket();
        ticket.issued = issued;
        ticket.nonce = nonce;

        ticket.ratio = u128::MAX;
        assert!(ticket.wins(reveal));

        ticket.ratio = draw.wrapping_sub(1);
        if draw > 0 {
            assert!(!ticket.wins(reveal));
        }
    }

    #[test]
    fn until_saturates() {
        let mut ticket = test_ticket();
        ticket.start = U256::MAX;
        ticket.range = 10;
        assert_eq!(ticket.until(), U256::MAX);
    }
}
