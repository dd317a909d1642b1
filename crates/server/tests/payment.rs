//! End-to-end payment scenarios driven through the packet pipeline with a
//! mock datagram link, a capturing egress, and the fixed-rate oracle.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use alloy_primitives::{eip191_hash_message, keccak256, Address, Bytes as RawBytes, B256, I256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use tollgate_chain::{ChainOracle, LotteryTuple, StaticOracle};
use tollgate_primitives::protocol::{self, Command, Header, Invoice};
use tollgate_primitives::{build_udp, lottery_draw, Flow, Ticket, CONTROL_PORT};
use tollgate_server::{DatagramLink, Egress, EgressError, Server, ServerConfig, ServerError};

const SECRET: B256 = B256::repeat_byte(0x5E);
const PROFIT: i64 = 10;

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn tuple() -> LotteryTuple {
    LotteryTuple {
        lottery: Address::repeat_byte(0xA1),
        chain: U256::from(100u64),
        recipient: Address::repeat_byte(0xB2),
    }
}

#[derive(Default)]
struct MockLink {
    sent: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl DatagramLink for MockLink {
    async fn send(&self, data: Bytes) -> Result<(), ServerError> {
        self.sent.lock().push(data);
        Ok(())
    }
}

#[derive(Default)]
struct MockEgress {
    sent: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl Egress for MockEgress {
    async fn send(&self, packet: Bytes) -> Result<(), EgressError> {
        self.sent.lock().push(packet);
        Ok(())
    }
}

struct Harness {
    server: Server,
    oracle: Arc<StaticOracle>,
    link: Arc<MockLink>,
    egress: Arc<MockEgress>,
}

fn harness(price_per_byte: u64, horizon: usize) -> Harness {
    let oracle = Arc::new(StaticOracle::new(
        tuple(),
        U256::from(price_per_byte),
        I256::unchecked_from(PROFIT),
    ));
    let egress = Arc::new(MockEgress::default());
    let config = ServerConfig {
        horizon,
        commit_secret: Some(SECRET),
        ..Default::default()
    };
    let server = Server::new(
        config,
        Some(oracle.clone() as Arc<dyn ChainOracle>),
        egress.clone(),
    );
    Harness {
        server,
        oracle,
        link: Arc::new(MockLink::default()),
        egress,
    }
}

fn client_socket() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 7, 0, 2), 40_000)
}

fn control_socket() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 7, 0, 1), CONTROL_PORT)
}

/// A well-formed ticket against the harness's lottery tuple, signed by a
/// fresh funder key.
fn signed_ticket(commit: B256, issued: u64, ratio: u128) -> Ticket {
    let signer = PrivateKeySigner::random();
    let now = unix_now();
    let mut ticket = Ticket {
        v: 0,
        r: B256::ZERO,
        s: B256::ZERO,
        commit,
        issued: U256::from(issued),
        nonce: keccak256(issued.to_be_bytes()),
        lottery: tuple().lottery,
        chain: tuple().chain,
        face_amount: 1_000_000,
        ratio,
        start: U256::from(now - 10),
        range: 3_600,
        funder: signer.address(),
        recipient: tuple().recipient,
        receipt: RawBytes::from_static(b"receipt"),
    };
    let digest = eip191_hash_message(ticket.ticket_hash());
    let signature = signer.sign_hash_sync(&digest).unwrap();
    ticket.v = if signature.v() { 28 } else { 27 };
    ticket.r = B256::from(signature.r());
    ticket.s = B256::from(signature.s());
    ticket
}

fn submit_packet(ticket: &Ticket) -> Bytes {
    let payload = protocol::encode_control(
        B256::repeat_byte(0x1D),
        &[Command::Submit(ticket.clone())],
    );
    build_udp(client_socket(), control_socket(), &payload)
}

/// Parses every invoice the server pushed down the link.
fn invoices(link: &MockLink) -> Vec<Invoice> {
    let mut out = Vec::new();
    for packet in link.sent.lock().iter() {
        let Flow::Control(datagram) = classify_reply(packet) else {
            continue;
        };
        let Ok((_, region)) = Header::decode(&datagram.payload) else {
            continue;
        };
        for command in protocol::scan(region).flatten() {
            if let Command::Invoice(invoice) = command {
                out.push(invoice);
            }
        }
    }
    out
}

/// Replies are addressed control -> client, so `classify` reports them as
/// forwardable; re-parse them from the client's perspective instead.
fn classify_reply(packet: &Bytes) -> Flow {
    let parsed = tollgate_primitives::classify(packet);
    if parsed != Flow::Forward {
        return parsed;
    }
    // Rewrite the destination port to the control port so the parser
    // extracts the payload for us.
    let mut copy = packet.to_vec();
    let header_len = ((copy[0] & 0x0F) as usize) * 4;
    copy[header_len..header_len + 2].copy_from_slice(&CONTROL_PORT.to_be_bytes());
    copy[header_len + 2..header_len + 4].copy_from_slice(&CONTROL_PORT.to_be_bytes());
    tollgate_primitives::classify(&copy)
}

#[tokio::test]
async fn honest_loser_leaves_balance_untouched() {
    let h = harness(0, 32);
    let commit = keccak256(SECRET);
    let ticket = signed_ticket(commit, unix_now(), 0);
    assert!(lottery_draw(SECRET, ticket.issued, ticket.nonce) > 0);

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;

    let stats = h.server.stats().unwrap();
    assert_eq!(stats.balance, I256::ZERO);
    assert_eq!(stats.pending, 0);
    assert!(h.oracle.grabs().is_empty());

    let invoices = invoices(&h.link);
    assert_eq!(invoices.len(), 1);
    assert!(invoices[0].serial >= 2);
    assert_eq!(invoices[0].commit, commit);
}

#[tokio::test]
async fn honest_winner_triggers_rotation_and_grab() {
    let h = harness(0, 32);
    let commit = keccak256(SECRET);
    let ticket = signed_ticket(commit, unix_now(), u128::MAX);

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;

    let grabs = h.oracle.grabs();
    assert_eq!(grabs.len(), 1);
    assert_eq!(grabs[0].reveal, SECRET);
    assert_eq!(grabs[0].commit, commit);
    assert_eq!(grabs[0].issued, ticket.issued);
    assert_eq!(grabs[0].nonce, ticket.nonce);
    assert_eq!(grabs[0].face_amount, ticket.face_amount);
    assert_eq!(grabs[0].funder, ticket.funder);
    assert!(grabs[0].old.is_empty());

    let stats = h.server.stats().unwrap();
    // ratio = 2^128 - 1 makes the expected value exactly the profit.
    assert_eq!(stats.balance, I256::unchecked_from(PROFIT));
    assert_ne!(stats.active_commit, commit);

    // The invoice emitted after the submission already carries the rotated
    // commit.
    let invoices = invoices(&h.link);
    assert_eq!(invoices.last().unwrap().commit, stats.active_commit);
}

#[tokio::test]
async fn replay_is_rejected_but_still_invoiced() {
    let h = harness(0, 32);
    let ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;
    let first = h.server.stats().unwrap();

    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;
    let second = h.server.stats().unwrap();

    assert_eq!(second.balance, first.balance);
    assert_eq!(second.pending, 0);
    assert_eq!(second.nonce_count, first.nonce_count);
    assert!(second.serial > first.serial);
    assert_eq!(invoices(&h.link).len(), 2);
}

#[tokio::test]
async fn invalid_funder_is_not_credited() {
    let h = harness(0, 32);
    h.oracle.set_funders_valid(false);
    let ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;

    let stats = h.server.stats().unwrap();
    assert_eq!(stats.balance, I256::ZERO);
    assert_eq!(stats.pending, 0);
    assert!(stats.serial >= 2);
    assert!(h.oracle.grabs().is_empty());

    // The pipeline invoice plus the post-rejection invoice.
    assert_eq!(invoices(&h.link).len(), 2);
}

#[tokio::test]
async fn balance_exhaustion_stops_forwarding() {
    // Every byte costs one unit; the floor is price(128 KiB).
    let h = harness(1, 32);
    let link: Arc<dyn DatagramLink> = h.link.clone();

    let destination = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
    let chunk = vec![0u8; 32 * 1024];

    // ~224 KiB of traffic in 32 KiB packets.
    for _ in 0..7 {
        let packet = build_udp(client_socket(), destination, &chunk);
        h.server.inbound(&link, packet).await;
    }
    h.server.drain().await;

    let stats = h.server.stats().unwrap();
    assert!(stats.exhausted);
    assert!(h.server.terminated());

    // Forwarding stopped with the packet that fell through the floor: the
    // fourth 32 KiB packet (plus headers) crosses price(128 KiB).
    let forwarded = h.egress.sent.lock().len();
    assert!(forwarded < 7, "forwarded all packets despite exhaustion");
    assert_eq!(forwarded, 3);

    // Outbound traffic is dropped too: the bonded link is gone.
    h.server.outbound(Bytes::from_static(b"late")).await;
    assert!(h.link.sent.lock().is_empty());
}

#[tokio::test]
async fn exact_floor_does_not_terminate() {
    let h = harness(1, 32);
    let link: Arc<dyn DatagramLink> = h.link.clone();
    let destination = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);

    // One packet whose total size is exactly the floor.
    let overhead = build_udp(client_socket(), destination, &[]).len();
    let chunk = vec![0u8; 128 * 1024 - overhead];
    let packet = build_udp(client_socket(), destination, &chunk);
    assert_eq!(packet.len(), 128 * 1024);

    h.server.inbound(&link, packet).await;
    let stats = h.server.stats().unwrap();
    assert_eq!(stats.balance, I256::unchecked_from(-(128 * 1024)));
    assert!(!stats.exhausted);
    assert_eq!(h.egress.sent.lock().len(), 1);

    // One more byte of billed traffic terminates.
    let tiny = build_udp(client_socket(), destination, &[0]);
    h.server.inbound(&link, tiny).await;
    assert!(h.server.stats().unwrap().exhausted);
}

#[tokio::test]
async fn horizon_eviction_advances_floor() {
    let horizon = 4;
    let h = harness(0, horizon);
    let commit = keccak256(SECRET);
    let link: Arc<dyn DatagramLink> = h.link.clone();

    let base = unix_now();
    let tickets: Vec<_> = (0..=horizon as u64)
        .map(|offset| signed_ticket(commit, base + offset, 0))
        .collect();
    for ticket in &tickets {
        h.server.inbound(&link, submit_packet(ticket)).await;
        h.server.drain().await;
    }

    let stats = h.server.stats().unwrap();
    assert_eq!(stats.nonce_count, horizon);
    assert_eq!(stats.issued_floor, U256::from(base + 1));

    // Resubmitting the first ticket is now stale, not replayed; nothing
    // lands in the ledger but the invoice still goes out.
    let before = h.server.stats().unwrap();
    h.server.inbound(&link, submit_packet(&tickets[0])).await;
    h.server.drain().await;
    let after = h.server.stats().unwrap();
    assert_eq!(after.nonce_count, before.nonce_count);
    assert_eq!(after.issued_floor, before.issued_floor);
    assert_eq!(after.balance, before.balance);
    assert_eq!(after.pending, 0);
    assert_eq!(invoices(&h.link).len(), horizon + 2);
}

#[tokio::test]
async fn wrong_lottery_is_refused() {
    let h = harness(0, 32);
    let mut ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);
    ticket.lottery = Address::repeat_byte(0xFF);

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;

    let stats = h.server.stats().unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.nonce_count, 0);
    // The closing invoice is still emitted.
    assert_eq!(invoices(&h.link).len(), 1);
}

#[tokio::test]
async fn expired_ticket_is_refused() {
    let h = harness(0, 32);
    let mut ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);
    ticket.start = U256::from(unix_now() - 10_000);
    ticket.range = 100;

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, submit_packet(&ticket)).await;
    h.server.drain().await;

    assert_eq!(h.server.stats().unwrap().nonce_count, 0);
    assert_eq!(invoices(&h.link).len(), 1);
}

#[tokio::test]
async fn corrupt_sibling_command_does_not_suppress_submission() {
    let h = harness(0, 32);
    let ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);

    // Header, then a framed-but-bogus command, then the real submission.
    let mut payload = protocol::encode_control(B256::ZERO, &[]).to_vec();
    payload.extend_from_slice(&4u16.to_be_bytes());
    payload.extend_from_slice(b"JUNK");
    let tail = protocol::encode_control(B256::ZERO, &[Command::Submit(ticket.clone())]);
    payload.extend_from_slice(&tail[36..]);
    let packet = build_udp(client_socket(), control_socket(), &payload);

    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.inbound(&link, packet).await;
    h.server.drain().await;

    // The good command landed: one nonce admitted, one credit resolved.
    let stats = h.server.stats().unwrap();
    assert_eq!(stats.nonce_count, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(invoices(&h.link).len(), 1);
}

#[tokio::test]
async fn open_link_sends_initial_invoice() {
    let h = harness(0, 32);
    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.open_link(link).await.unwrap();

    let invoices = invoices(&h.link);
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].commit, keccak256(SECRET));
    assert_eq!(invoices[0].lottery, tuple().lottery);
    assert_eq!(invoices[0].recipient, tuple().recipient);
    assert_eq!(invoices[0].balance, I256::unchecked_from(0));
}

#[tokio::test]
async fn unbilled_server_forwards_and_stays_silent() {
    let egress = Arc::new(MockEgress::default());
    let server = Server::new(ServerConfig::default(), None, egress.clone());
    let link_impl = Arc::new(MockLink::default());
    let link: Arc<dyn DatagramLink> = link_impl.clone();

    server.open_link(Arc::clone(&link)).await.unwrap();
    assert!(link_impl.sent.lock().is_empty());

    // Control datagrams are consumed without processing.
    let ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);
    server.inbound(&link, submit_packet(&ticket)).await;
    server.drain().await;
    assert!(link_impl.sent.lock().is_empty());
    assert!(server.stats().is_none());

    // Ordinary traffic forwards unmetered.
    let destination = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
    let packet = build_udp(client_socket(), destination, b"data");
    server.inbound(&link, packet).await;
    assert_eq!(egress.sent.lock().len(), 1);

    // And flows back out subject to no balance at all.
    server.outbound(Bytes::from_static(b"reply")).await;
    assert_eq!(link_impl.sent.lock().len(), 1);
}

#[tokio::test]
async fn shutdown_refuses_new_control_work() {
    let h = harness(0, 32);
    let link: Arc<dyn DatagramLink> = h.link.clone();
    h.server.shut().await;

    let ticket = signed_ticket(keccak256(SECRET), unix_now(), 0);
    h.server.inbound(&link, submit_packet(&ticket)).await;

    let stats = h.server.stats().unwrap();
    assert_eq!(stats.nonce_count, 0);
    assert!(invoices(&h.link).is_empty());
}

#[tokio::test]
async fn serial_strictly_increases_across_submissions() {
    let h = harness(0, 32);
    let commit = keccak256(SECRET);
    let link: Arc<dyn DatagramLink> = h.link.clone();

    let base = unix_now();
    let mut last = 0u64;
    for offset in 0..3u64 {
        let ticket = signed_ticket(commit, base + offset, 0);
        h.server.inbound(&link, submit_packet(&ticket)).await;
        h.server.drain().await;
        let serial = h.server.stats().unwrap().serial;
        assert!(serial > last);
        last = serial;
    }

    let seen: Vec<u64> = invoices(&h.link).iter().map(|i| i.serial).collect();
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted, "invoice serials regressed");
}
