//! Chain boundary: the traits the off-chain services talk through, plus the
//! in-process ledger host and the RPC fee oracle that implement them.

pub mod facility;
pub mod local;
pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::pool::events::PoolEvent;
use crate::pool::models::{Address, AssetId, PoolStatus, Timestamp};

pub use facility::LendingFacility;
pub use local::LocalChain;
pub use rpc::RpcFeeOracle;

pub type BlockNumber = u64;

/// An event as observed on chain, with its position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    /// Emitting contract
    pub address: Address,
    pub block_number: BlockNumber,
    pub log_index: u32,
    pub tx_hash: String,
    pub event: PoolEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: BlockNumber,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Gas settings attached to a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasParams {
    pub gas_limit: u64,
    pub fee: FeeQuote,
}

impl GasParams {
    /// limit = estimate * (100 + margin) / 100
    pub fn with_margin(estimate: u64, margin_percent: u64, fee: FeeQuote) -> Self {
        let gas_limit = (estimate as u128 * (100 + margin_percent as u128) / 100)
            .min(u64::MAX as u128) as u64;
        Self { gas_limit, fee }
    }
}

/// Read-only view of a pool's on-chain state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub address: Address,
    pub name: String,
    pub owner: Address,
    pub status: PoolStatus,
    pub lock_until: Timestamp,
    pub lock_period: i64,
    pub current_window: u32,
    pub member_count: usize,
}

/// Result of an on-chain eligibility query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub status: PoolStatus,
    pub lock_elapsed: bool,
    /// Unsettled assets with a nonzero custody claim
    pub claims: Vec<(AssetId, u128)>,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        self.status == PoolStatus::Active && self.lock_elapsed
    }
}

/// Signing and broadcast facility for operator transactions
#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn block_number(&self) -> AppResult<BlockNumber>;

    async fn pool_snapshot(&self, pool: &Address) -> AppResult<PoolSnapshot>;

    async fn check_eligibility(&self, pool: &Address) -> AppResult<Eligibility>;

    async fn estimate_settlement_gas(&self, pool: &Address, asset: &AssetId) -> AppResult<u64>;

    /// Submit and wait for the receipt. Business-rule reverts come back as
    /// `ChainError::Reverted`.
    async fn submit_settlement(
        &self,
        pool: &Address,
        asset: &AssetId,
        gas: GasParams,
    ) -> AppResult<TxReceipt>;
}

/// Current network fee parameters; never cached by callers
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn fee_quote(&self) -> AppResult<FeeQuote>;
}

/// Log access for the reconciliation listener
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Live feed of every new log. Consumers filter by emitting address.
    async fn subscribe(&self) -> AppResult<broadcast::Receiver<ChainLog>>;

    /// Logs emitted by `pool` in `[from, to]`, in chain order
    async fn logs(&self, pool: &Address, from: BlockNumber, to: BlockNumber) -> AppResult<Vec<ChainLog>>;

    /// Every log of one transaction, including other contracts' logs
    async fn transaction_logs(&self, tx_hash: &str) -> AppResult<Vec<ChainLog>>;

    async fn head_block(&self) -> AppResult<BlockNumber>;
}
