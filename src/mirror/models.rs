use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::models::{Address, AssetId, Timestamp};

/// Durable view of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: Address,
    pub name: String,
    pub owner: Address,
    /// Seconds from creation until settlement unlocks
    pub lock_period: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PoolRecord {
    pub fn new(address: Address, name: impl Into<String>, owner: Address, lock_period: i64) -> Self {
        Self {
            address,
            name: name.into(),
            owner,
            lock_period,
            is_active: true,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub member: Address,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub contribution: Decimal,
    pub paid_at: DateTime<Utc>,
}

/// One settled asset of one pool, keyed by (pool, asset, tx_hash)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub pool: Address,
    pub asset: AssetId,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub principal: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub interest: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub distributable: Decimal,
    pub payouts: Vec<PayoutRecord>,
    pub tx_hash: String,
    pub block_number: i64,
    pub settled_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn has_payout_for(&self, member: &Address) -> bool {
        self.payouts.iter().any(|p| &p.member == member)
    }

    pub fn paid_out(&self) -> Decimal {
        self.payouts.iter().map(|p| p.amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldWithdrawalRecord {
    pub pool: Address,
    pub asset: AssetId,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub tx_hash: String,
    pub block_number: i64,
}

/// Result of a uniquely-keyed append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
}

impl AppendOutcome {
    pub fn is_inserted(self) -> bool {
        self == AppendOutcome::Inserted
    }
}

/// Chain timestamps are unix seconds
pub fn to_datetime(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}
