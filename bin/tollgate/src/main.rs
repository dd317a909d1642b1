//! Tollgate dev entrypoint.
//!
//! Reads one SDP offer from stdin, prints the filtered answer to stdout,
//! and serves the session until interrupted. Signaling transport, TLS
//! material loading, and the real egress stack are deployment concerns and
//! live outside this binary; a fixed-rate oracle stands in for the chain
//! client so the payment pipeline can be exercised end to end.

use std::sync::Arc;

use alloy_primitives::{Address, I256, U256};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use eyre::{Result, WrapErr};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use tollgate_chain::{ChainOracle, LotteryTuple, StaticOracle};
use tollgate_server::{Egress, EgressError, Server, ServerConfig};

/// Tollgate - incentivized VPN egress node
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Lottery contract address tickets must name.
    #[arg(long)]
    lottery: Address,

    /// Payout account tickets must name.
    #[arg(long)]
    recipient: Address,

    /// Chain id of the lottery contract.
    #[arg(long, default_value_t = 100)]
    chain_id: u64,

    /// Price per tunneled byte, in token units.
    #[arg(long, default_value_t = 1)]
    price_per_byte: u64,

    /// Flat redemption profit quoted by the dev oracle.
    #[arg(long, default_value_t = 1_000_000)]
    profit: i64,

    /// Replay-window size over accepted tickets.
    #[arg(long, default_value_t = 32)]
    horizon: usize,

    /// STUN/TURN server URL; repeatable.
    #[arg(long = "stun")]
    stun: Vec<String>,

    /// Serve without billing: forward everything, emit no invoices.
    #[arg(long)]
    unbilled: bool,
}

/// Stand-in egress that logs and discards. A deployment binds a raw IP
/// socket here instead.
struct DiscardEgress;

#[async_trait]
impl Egress for DiscardEgress {
    async fn send(&self, packet: Bytes) -> Result<(), EgressError> {
        debug!(len = packet.len(), "discarding egress packet");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tollgate=debug".parse()?),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let oracle: Option<Arc<dyn ChainOracle>> = if cli.unbilled {
        None
    } else {
        Some(Arc::new(StaticOracle::new(
            LotteryTuple {
                lottery: cli.lottery,
                chain: U256::from(cli.chain_id),
                recipient: cli.recipient,
            },
            U256::from(cli.price_per_byte),
            I256::unchecked_from(cli.profit),
        )))
    };

    let config = ServerConfig {
        horizon: cli.horizon,
        ice_servers: cli.stun.clone(),
        ..Default::default()
    };
    let server = Server::new(config, oracle, Arc::new(DiscardEgress));

    info!("reading SDP offer from stdin");
    let mut offer = String::new();
    tokio::io::stdin()
        .read_to_string(&mut offer)
        .await
        .wrap_err("failed to read offer")?;

    let answer = server.respond(offer.trim()).await?;
    println!("{answer}");
    info!(sessions = server.active_sessions(), "session accepted");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shut().await;
    Ok(())
}
