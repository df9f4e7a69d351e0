//! Queryable mirror of on-chain settlement state.
//!
//! Every write is either a uniquely-keyed append (reporting `Duplicate`
//! instead of failing) or an idempotent find-and-update, so the scheduler
//! and listener can share one store without coordination.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::pool::models::Address;

pub use memory::MemoryMirrorStore;
pub use models::*;
pub use postgres::PgMirrorStore;

#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn upsert_pool(&self, pool: PoolRecord) -> AppResult<()>;

    async fn get_pool(&self, address: &Address) -> AppResult<Option<PoolRecord>>;

    async fn list_active_pools(&self) -> AppResult<Vec<PoolRecord>>;

    /// Returns false if the pool was already inactive or is unknown
    async fn mark_pool_inactive(&self, address: &Address, completed_at: DateTime<Utc>) -> AppResult<bool>;

    async fn append_settlement(&self, record: SettlementRecord) -> AppResult<AppendOutcome>;

    /// Most recently appended settlement of the pool
    async fn latest_settlement(&self, pool: &Address) -> AppResult<Option<SettlementRecord>>;

    async fn append_payout(&self, settlement_id: Uuid, payout: PayoutRecord) -> AppResult<AppendOutcome>;

    async fn record_yield_withdrawal(&self, record: YieldWithdrawalRecord) -> AppResult<AppendOutcome>;

    async fn yield_withdrawals(&self, pool: &Address) -> AppResult<Vec<YieldWithdrawalRecord>>;

    /// Settlements in append order
    async fn settlements_for_pool(&self, pool: &Address) -> AppResult<Vec<SettlementRecord>>;
}
