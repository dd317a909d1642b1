//! Ticket evaluation.
//!
//! A `Submit` command runs in two phases. The synchronous phase validates
//! the ticket, prices its redemption, and admits it into the ledger's
//! critical section (replay window, commit lookup, pending credit, winner
//! draw, commit rotation). The asynchronous phase - the funder check and
//! any on-chain redemption - runs in the nest, fire-and-forget, so a slow
//! oracle never stalls the packet pipeline.

use std::sync::Arc;

use alloy_primitives::{Address, B256, I256, U256, U512};
use tracing::{debug, info, warn};

use tollgate_chain::{GrabCall, RedemptionQuote};
use tollgate_ledger::TicketAdmission;
use tollgate_primitives::Ticket;

use crate::error::ServerError;
use crate::server::{ReplyPath, Server};
use crate::DatagramLink;

/// Synchronous phase of a submission. Returns once the ticket is admitted
/// and the resolution task is hatched.
pub(crate) async fn submit(
    server: &Server,
    link: &Arc<dyn DatagramLink>,
    reply: ReplyPath,
    id: B256,
    ticket: Ticket,
    now: u64,
) -> Result<(), ServerError> {
    let Some(billing) = server.inner().billing.as_ref() else {
        return Ok(());
    };

    let tuple = billing.oracle.tuple();
    if (ticket.lottery, ticket.chain, ticket.recipient)
        != (tuple.lottery, tuple.chain, tuple.recipient)
    {
        return Err(ServerError::WrongLottery);
    }
    if ticket.until() <= U256::from(now) {
        return Err(ServerError::ExpiredTicket);
    }

    let signer = ticket.recover_signer()?;

    let gas = server.inner().config.gas_budget;
    let quote = billing
        .oracle
        .credit(now, ticket.start, ticket.range, ticket.face_amount, gas)
        .await?;
    if quote.profit <= I256::ZERO {
        // Not worth redeeming; a courtesy signal with no accounting effect.
        debug!(profit = %quote.profit, "ignoring unprofitable ticket");
        return Ok(());
    }

    let value = expected_value(quote.profit, ticket.ratio);
    let ticket_hash = ticket.ticket_hash();

    let admission = billing.ledger.lock().admit_ticket(
        ticket_hash,
        ticket.commit,
        ticket.issued,
        ticket.nonce,
        signer,
        ticket.ratio,
        value,
        now,
    )?;

    let resolution = resolve(
        server.clone(),
        Arc::clone(link),
        reply,
        id,
        ticket,
        ticket_hash,
        signer,
        admission,
        quote,
        gas,
    );
    if !server.inner().nest.hatch(resolution) {
        // Shutting down: the pending entry must still resolve, so run the
        // check inline instead of leaking it.
        resolve_inline(server, link, reply, id, ticket_hash).await;
    }
    Ok(())
}

/// Asynchronous phase: funder verification, ledger resolution, and the
/// redemption of winners.
#[allow(clippy::too_many_arguments)]
async fn resolve(
    server: Server,
    link: Arc<dyn DatagramLink>,
    reply: ReplyPath,
    id: B256,
    ticket: Ticket,
    ticket_hash: B256,
    signer: Address,
    admission: TicketAdmission,
    quote: RedemptionQuote,
    gas: U256,
) {
    let Some(billing) = server.inner().billing.as_ref() else {
        return;
    };

    let credited = match billing
        .oracle
        .check_funder(
            signer,
            ticket.funder,
            ticket.face_amount,
            ticket.recipient,
            &ticket.receipt,
        )
        .await
    {
        Ok(valid) => valid,
        Err(error) => {
            debug!(%error, "funder check failed; treating ticket as invalid");
            false
        }
    };

    billing.ledger.lock().resolve_expected(ticket_hash, credited);

    if !credited {
        // Show the client it was not credited.
        if let Err(error) = server.send_invoice(&link, reply, id).await {
            debug!(%error, "post-rejection invoice failed");
        }
        return;
    }
    if !admission.winner {
        return;
    }

    let call = GrabCall {
        reveal: admission.reveal,
        commit: ticket.commit,
        issued: ticket.issued,
        nonce: ticket.nonce,
        v: ticket.v,
        r: ticket.r,
        s: ticket.s,
        face_amount: ticket.face_amount,
        ratio: ticket.ratio,
        start: ticket.start,
        range: ticket.range,
        funder: ticket.funder,
        recipient: ticket.recipient,
        receipt: ticket.receipt,
        old: Vec::new(),
    };
    match billing.oracle.send_grab(gas, quote.gas_price, call).await {
        Ok(()) => info!(ticket = %ticket_hash, "submitted winning redemption"),
        Err(error) => warn!(%error, ticket = %ticket_hash, "redemption submission failed"),
    }
}

/// Degenerate resolution used when the nest is closed: the oracle is not
/// consulted, the ticket is simply not credited.
async fn resolve_inline(
    server: &Server,
    link: &Arc<dyn DatagramLink>,
    reply: ReplyPath,
    id: B256,
    ticket_hash: B256,
) {
    if let Some(billing) = server.inner().billing.as_ref() {
        billing.ledger.lock().resolve_expected(ticket_hash, false);
    }
    if let Err(error) = server.send_invoice(link, reply, id).await {
        debug!(%error, "shutdown invoice failed");
    }
}

/// The expected-value contribution of a ticket:
/// `profit * (ratio + 1) / 2^128`, computed in 512-bit fixed point.
pub(crate) fn expected_value(profit: I256, ratio: u128) -> I256 {
    let profit = widen(profit.into_raw());
    let odds = widen(U256::from(ratio)) + U512::from(1u8);
    let wide = (profit * odds) >> 128;
    I256::from_raw(narrow(wide))
}

fn widen(value: U256) -> U512 {
    U512::from_be_slice(&value.to_be_bytes::<32>())
}

fn narrow(value: U512) -> U256 {
    let bytes = value.to_be_bytes::<64>();
    U256::from_be_slice(&bytes[32..])
}
