//! The blockchain oracle consumed by the payment pipeline.
//!
//! The server never talks to a node directly; it goes through
//! [`ChainOracle`], a request/response seam that prices bandwidth, names
//! the lottery it collects through, quotes redemption profitability,
//! verifies funders, and submits winning `grab` transactions.
//!
//! Byte pricing is deliberately synchronous: implementations are expected
//! to serve it from a cached exchange rate so the billing path never
//! suspends. Only `credit`, `check_funder`, and `send_grab` are RPCs.

use alloy_primitives::{Address, Bytes, B256, I256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

/// The `(lottery, chain, recipient)` tuple the server collects through.
/// Tickets naming any other tuple are refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotteryTuple {
    /// Lottery contract address.
    pub lottery: Address,
    /// Chain id the contract lives on.
    pub chain: U256,
    /// The server's payout account.
    pub recipient: Address,
}

/// Profitability quote for redeeming a ticket now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedemptionQuote {
    /// Expected proceeds after gas, in token units. Non-positive means the
    /// ticket is not worth redeeming.
    pub profit: I256,
    /// Gas price to use for the redemption transaction.
    pub gas_price: U256,
}

/// Arguments of an on-chain `grab` redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabCall {
    pub reveal: B256,
    pub commit: B256,
    pub issued: U256,
    pub nonce: B256,
    pub v: u8,
    pub r: B256,
    pub s: B256,
    pub face_amount: u128,
    pub ratio: u128,
    pub start: U256,
    pub range: u128,
    pub funder: Address,
    pub recipient: Address,
    pub receipt: Bytes,
    /// Revoked ticket hashes; currently always empty.
    pub old: Vec<B256>,
}

/// Oracle RPC failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// The underlying RPC call failed.
    #[error("oracle rpc failed: {0}")]
    Rpc(String),
}

/// Request/response oracle over the blockchain and the exchange rate.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// Price in token units for moving `bytes` through the tunnel.
    /// Served from a cached rate; must not block.
    fn convert(&self, bytes: u64) -> U256;

    /// The lottery tuple this server redeems against.
    fn tuple(&self) -> LotteryTuple;

    /// Quotes the profit of redeeming a `face_amount` ticket with the given
    /// validity window at the current gas market, assuming `gas` units.
    async fn credit(
        &self,
        now: u64,
        start: U256,
        range: u128,
        face_amount: u128,
        gas: U256,
    ) -> Result<RedemptionQuote, OracleError>;

    /// Checks that `signer` is authorized to spend `face_amount` from
    /// `funder` toward `recipient`, given the client's receipt.
    async fn check_funder(
        &self,
        signer: Address,
        funder: Address,
        face_amount: u128,
        recipient: Address,
        receipt: &Bytes,
    ) -> Result<bool, OracleError>;

    /// Submits a winning redemption. Best effort: the caller logs failures
    /// and moves on.
    async fn send_grab(
        &self,
        gas: U256,
        gas_price: U256,
        call: GrabCall,
    ) -> Result<(), OracleError>;
}

/// A fixed-rate oracle for development networks and tests.
///
/// Prices bytes linearly, quotes a flat profit margin, approves or rejects
/// all funders by a switch, and records submitted grabs instead of
/// broadcasting them.
#[derive(Debug)]
pub struct StaticOracle {
    price_per_byte: U256,
    tuple: LotteryTuple,
    gas_price: U256,
    profit: I256,
    funders_valid: Mutex<bool>,
    grabs: Mutex<Vec<GrabCall>>,
}

impl StaticOracle {
    /// Creates an oracle pricing every byte at `price_per_byte` and quoting
    /// `profit` for every redemption.
    pub fn new(tuple: LotteryTuple, price_per_byte: U256, profit: I256) -> Self {
        Self {
            price_per_byte,
            tuple,
            gas_price: U256::from(1_000_000_000u64),
            profit,
            funders_valid: Mutex::new(true),
            grabs: Mutex::new(Vec::new()),
        }
    }

    /// Switches whether `check_funder` approves.
    pub fn set_funders_valid(&self, valid: bool) {
        *self.funders_valid.lock() = valid;
    }

    /// Grabs recorded so far.
    pub fn grabs(&self) -> Vec<GrabCall> {
        self.grabs.lock().clone()
    }
}

#[async_trait]
impl ChainOracle for StaticOracle {
    fn convert(&self, bytes: u64) -> U256 {
        self.price_per_byte * U256::from(bytes)
    }

    fn tuple(&self) -> LotteryTuple {
        self.tuple.clone()
    }

    async fn credit(
        &self,
        _now: u64,
        _start: U256,
        _range: u128,
        _face_amount: u128,
        _gas: U256,
    ) -> Result<RedemptionQuote, OracleError> {
        Ok(RedemptionQuote {
            profit: self.profit,
            gas_price: self.gas_price,
        })
    }

    async fn check_funder(
        &self,
        _signer: Address,
        _funder: Address,
        _face_amount: u128,
        _recipient: Address,
        _receipt: &Bytes,
    ) -> Result<bool, OracleError> {
        Ok(*self.funders_valid.lock())
    }

    async fn send_grab(
        &self,
        _gas: U256,
        _gas_price: U256,
        call: GrabCall,
    ) -> Result<(), OracleError> {
        self.grabs.lock().push(call);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tuple() -> LotteryTuple {
        LotteryTuple {
            lottery: Address::repeat_byte(0x01),
            chain: U256::from(100u64),
            recipient: Address::repeat_byte(0x02),
        }
    }

    #[test]
    fn linear_pricing() {
        let oracle = StaticOracle::new(test_tuple(), U256::from(3u64), I256::unchecked_from(10));
        assert_eq!(oracle.convert(0), U256::ZERO);
        assert_eq!(oracle.convert(100), U256::from(300u64));
    }

    #[tokio::test]
    async fn records_grabs() {
        let oracle = StaticOracle::new(test_tuple(), U256::ONE, I256::unchecked_from(10));
        let call = GrabCall {
            reveal: B256::repeat_byte(1),
            commit: B256::repeat_byte(2),
            issued: U256::from(3u64),
            nonce: B256::repeat_byte(4),
            v: 27,
            r: B256::repeat_byte(5),
            s: B256::repeat_byte(6),
            face_amount: 7,
            ratio: 8,
            start: U256::from(9u64),
            range: 10,
            funder: Address::repeat_byte(11),
            recipient: Address::repeat_byte(12),
            receipt: Bytes::new(),
            old: Vec::new(),
        };
        oracle
            .send_grab(U256::from(100_000u64), U256::ONE, call.clone())
            .await
            .unwrap();
        assert_eq!(oracle.grabs(), vec![call]);
    }

    #[tokio::test]
    async fn funder_switch() {
        let oracle = StaticOracle::new(test_tuple(), U256::ONE, I256::unchecked_from(10));
        let receipt = Bytes::new();
        assert!(oracle
            .check_funder(Address::ZERO, Address::ZERO, 1, Address::ZERO, &receipt)
            .await
            .unwrap());
        oracle.set_funders_valid(false);
        assert!(!oracle
            .check_funder(Address::ZERO, Address::ZERO, 1, Address::ZERO, &receipt)
            .await
            .unwrap());
    }
}
