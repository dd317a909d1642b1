//! The per-peer server: billing pipeline and invoice emission.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use alloy_primitives::{B256, I256, U256};
use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use tollgate_chain::ChainOracle;
use tollgate_ledger::Ledger;
use tollgate_primitives::protocol::{self, Command, Header, Invoice};
use tollgate_primitives::{build_udp, classify, Flow, UdpDatagram, CONTROL_PORT};

use crate::config::ServerConfig;
use crate::egress::Egress;
use crate::error::ServerError;
use crate::evaluator;
use crate::nest::Nest;
use crate::session::Session;
use crate::DatagramLink;

/// Where a control reply goes: the original datagram's addressing,
/// reversed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplyPath {
    pub from: SocketAddrV4,
    pub to: SocketAddrV4,
}

impl ReplyPath {
    fn reverse(datagram: &UdpDatagram) -> Self {
        Self {
            from: datagram.destination,
            to: datagram.source,
        }
    }

    /// The session-open invoice has no originating datagram; both ends are
    /// the reserved control port.
    fn control() -> Self {
        let socket = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CONTROL_PORT);
        Self {
            from: socket,
            to: socket,
        }
    }
}

/// Outcome of charging the ledger for a packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BillVerdict {
    /// Whether the packet may proceed.
    pub allowed: bool,
    /// Whether the balance has fallen through the floor.
    pub exhausted: bool,
}

pub(crate) struct Billing {
    pub oracle: Arc<dyn ChainOracle>,
    pub ledger: Mutex<Ledger>,
}

/// Operator-facing view of a session's payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    pub serial: u64,
    /// Balance without pending credits.
    pub balance: I256,
    /// Tickets awaiting their on-chain validity check.
    pub pending: usize,
    /// Triples currently in the replay window.
    pub nonce_count: usize,
    pub issued_floor: U256,
    pub active_commit: B256,
    pub exhausted: bool,
}

pub(crate) struct ServerInner {
    pub config: ServerConfig,
    pub billing: Option<Billing>,
    pub egress: Arc<dyn Egress>,
    pub nest: Arc<Nest>,
    pub link: Mutex<Option<Arc<dyn DatagramLink>>>,
    pub sessions: Mutex<HashMap<u64, Arc<Session>>>,
    terminated: AtomicBool,
}

/// The per-peer server instance. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a server. `oracle == None` disables billing entirely: all
    /// traffic forwards unmetered and control datagrams are consumed
    /// without processing.
    pub fn new(
        config: ServerConfig,
        oracle: Option<Arc<dyn ChainOracle>>,
        egress: Arc<dyn Egress>,
    ) -> Self {
        let billing = oracle.map(|oracle| Billing {
            oracle,
            ledger: Mutex::new(Ledger::with_commit_secret(
                config.horizon,
                config.commit_secret,
                unix_now(),
            )),
        });
        Self {
            inner: Arc::new(ServerInner {
                config,
                billing,
                egress,
                nest: Nest::new(),
                link: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ServerInner {
        &self.inner
    }

    /// Bonds the peer datagram channel and, when billing is enabled, sends
    /// the opening invoice. An error here means the session must be closed
    /// without any invoice going out.
    pub async fn open_link(&self, link: Arc<dyn DatagramLink>) -> Result<(), ServerError> {
        *self.inner.link.lock() = Some(Arc::clone(&link));
        if self.inner.billing.is_some() {
            self.send_invoice(&link, ReplyPath::control(), B256::ZERO)
                .await?;
        }
        Ok(())
    }

    /// Handles one inbound ciphertext datagram from the peer.
    ///
    /// The datagram is billed unconditionally; its inner IP packet is then
    /// either consumed as control traffic or forwarded to the egress.
    pub async fn inbound(&self, link: &Arc<dyn DatagramLink>, data: Bytes) {
        counter!("tollgate.inbound_bytes_total").increment(data.len() as u64);
        let verdict = self.charge(data.len(), true);
        if verdict.exhausted {
            self.terminate().await;
            return;
        }

        match classify(&data) {
            Flow::Malformed => trace!(len = data.len(), "dropping malformed inner packet"),
            Flow::Forward => {
                if let Err(error) = self.inner.egress.send(data).await {
                    debug!(%error, "egress refused packet");
                } else {
                    counter!("tollgate.forwarded_packets_total").increment(1);
                }
            }
            Flow::Control(datagram) => {
                if self.inner.billing.is_none() {
                    // Unbilled servers consume control traffic silently.
                    return;
                }
                let server = self.clone();
                let link = Arc::clone(link);
                let hatched = self
                    .inner
                    .nest
                    .hatch(async move { server.handle_control(link, datagram).await });
                if !hatched {
                    trace!("nest closed; dropped control datagram");
                }
            }
        }
    }

    /// Handles one packet arriving from the egress toward the peer.
    ///
    /// Billed without force: an insufficient balance just drops the packet.
    pub async fn outbound(&self, packet: Bytes) {
        let link = self.inner.link.lock().clone();
        let Some(link) = link else {
            trace!("no bonded channel; dropping egress packet");
            return;
        };
        if let Err(error) = self.send_to_peer(&link, packet, false).await {
            debug!(%error, "outbound send failed");
        }
    }

    /// Graceful shutdown: close the nest gate, wait for in-flight tasks,
    /// then tear down transport and egress in parallel.
    pub async fn shut(&self) {
        self.inner.nest.close().await;

        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        *self.inner.link.lock() = None;

        let close_sessions = async {
            for session in sessions {
                session.close().await;
            }
        };
        let shut_egress = async {
            if let Err(error) = self.inner.egress.shut().await {
                warn!(%error, "egress shutdown failed");
            }
        };
        futures::join!(close_sessions, shut_egress);
    }

    /// Waits for in-flight pipeline tasks without closing the nest. Useful
    /// for status probes that want a settled ledger.
    pub async fn drain(&self) {
        self.inner.nest.drain().await;
    }

    /// Snapshot of the payment state, `None` when billing is disabled.
    pub fn stats(&self) -> Option<LedgerStats> {
        let billing = self.inner.billing.as_ref()?;
        let ledger = billing.ledger.lock();
        Some(LedgerStats {
            serial: ledger.serial(),
            balance: ledger.balance(),
            pending: ledger.pending(),
            nonce_count: ledger.nonces().len(),
            issued_floor: ledger.nonces().issued_floor(),
            active_commit: ledger.commits().active_commit(),
            exhausted: ledger.exhausted(),
        })
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Charges the ledger for `bytes`. Never suspends.
    pub(crate) fn charge(&self, bytes: usize, force: bool) -> BillVerdict {
        let Some(billing) = &self.inner.billing else {
            return BillVerdict {
                allowed: true,
                exhausted: false,
            };
        };
        let price = billing.oracle.convert(bytes as u64);
        let floor = billing.oracle.convert(self.inner.config.floor_bytes);
        let mut ledger = billing.ledger.lock();
        let allowed = ledger.bill(price, floor, force);
        if allowed {
            counter!("tollgate.billed_bytes_total").increment(bytes as u64);
        }
        BillVerdict {
            allowed,
            exhausted: ledger.exhausted(),
        }
    }

    /// Bills and sends one datagram toward the peer.
    pub(crate) async fn send_to_peer(
        &self,
        link: &Arc<dyn DatagramLink>,
        packet: Bytes,
        force: bool,
    ) -> Result<(), ServerError> {
        let verdict = self.charge(packet.len(), force);
        if verdict.exhausted {
            self.terminate().await;
            return Err(ServerError::BalanceExhausted);
        }
        if !verdict.allowed {
            trace!(len = packet.len(), "insufficient balance; dropping packet");
            return Ok(());
        }
        link.send(packet).await
    }

    /// Parses a control datagram and dispatches its commands; a closing
    /// invoice always follows, whatever the commands did.
    async fn handle_control(&self, link: Arc<dyn DatagramLink>, datagram: UdpDatagram) {
        let (header, region) = match Header::decode(&datagram.payload) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(%error, "dropping control datagram");
                return;
            }
        };
        let reply = ReplyPath::reverse(&datagram);
        let now = unix_now();

        for command in protocol::scan(region) {
            match command {
                Ok(Command::Submit(ticket)) => {
                    if let Err(error) =
                        evaluator::submit(self, &link, reply, header.id, ticket, now).await
                    {
                        debug!(%error, "ticket refused");
                    }
                }
                Ok(command) => trace!(?command, "ignoring unexpected command"),
                Err(error) => debug!(%error, "skipping undecodable command"),
            }
        }

        if let Err(error) = self.send_invoice(&link, reply, header.id).await {
            debug!(%error, "invoice emission failed");
        }
    }

    /// Snapshots the ledger and sends an invoice datagram to the peer's
    /// control address. The snapshot is taken under the lock; the send is
    /// not.
    pub(crate) async fn send_invoice(
        &self,
        link: &Arc<dyn DatagramLink>,
        reply: ReplyPath,
        id: B256,
    ) -> Result<(), ServerError> {
        let Some(billing) = &self.inner.billing else {
            return Ok(());
        };
        let snapshot = billing.ledger.lock().snapshot();
        let tuple = billing.oracle.tuple();

        let commands = [
            Command::Stamp(monotonic_micros()),
            Command::Invoice(Invoice {
                serial: snapshot.serial,
                balance: snapshot.balance,
                lottery: tuple.lottery,
                chain: tuple.chain,
                recipient: tuple.recipient,
                commit: snapshot.commit,
            }),
        ];
        let payload = protocol::encode_control(id, &commands);
        let packet = build_udp(reply.from, reply.to, &payload);
        counter!("tollgate.invoices_total").increment(1);
        self.send_to_peer(link, packet, true).await
    }

    /// Drops every session self-reference. Idempotent.
    pub(crate) async fn terminate(&self) {
        if !self.inner.terminated.swap(true, Ordering::AcqRel) {
            warn!("balance exhausted; terminating session");
        }
        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        *self.inner.link.lock() = None;
        for session in sessions {
            session.close().await;
        }
    }

    /// Whether the server has torn its sessions down.
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn adopt(&self, id: u64, session: Arc<Session>) {
        self.inner.sessions.lock().insert(id, session);
    }

    pub(crate) fn release(&self, id: u64) {
        self.inner.sessions.lock().remove(&id);
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

static START: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic microseconds since process start; stamps invoices.
pub(crate) fn monotonic_micros() -> u64 {
    START.elapsed().as_micros() as u64
}
