use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::mirror::{
    AppendOutcome, MirrorStore, PayoutRecord, PoolRecord, SettlementRecord, YieldWithdrawalRecord,
};
use crate::pool::models::Address;

/// Process-local mirror, used when no database is configured and in tests
pub struct MemoryMirrorStore {
    pools: RwLock<HashMap<Address, PoolRecord>>,
    settlements: RwLock<HashMap<Address, Vec<SettlementRecord>>>,
    yield_withdrawals: RwLock<HashMap<Address, Vec<YieldWithdrawalRecord>>>,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            settlements: RwLock::new(HashMap::new()),
            yield_withdrawals: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMirrorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn upsert_pool(&self, pool: PoolRecord) -> AppResult<()> {
        let mut pools = self.pools.write().await;
        pools.insert(pool.address.clone(), pool);
        Ok(())
    }

    async fn get_pool(&self, address: &Address) -> AppResult<Option<PoolRecord>> {
        let pools = self.pools.read().await;
        Ok(pools.get(address).cloned())
    }

    async fn list_active_pools(&self) -> AppResult<Vec<PoolRecord>> {
        let pools = self.pools.read().await;
        let mut active: Vec<PoolRecord> = pools.values().filter(|p| p.is_active).cloned().collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.address.cmp(&b.address)));
        Ok(active)
    }

    async fn mark_pool_inactive(&self, address: &Address, completed_at: DateTime<Utc>) -> AppResult<bool> {
        let mut pools = self.pools.write().await;
        match pools.get_mut(address) {
            Some(pool) if pool.is_active => {
                pool.is_active = false;
                pool.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_settlement(&self, record: SettlementRecord) -> AppResult<AppendOutcome> {
        let mut settlements = self.settlements.write().await;
        let entries = settlements.entry(record.pool.clone()).or_default();
        let exists = entries
            .iter()
            .any(|s| s.asset == record.asset && s.tx_hash == record.tx_hash);
        if exists {
            return Ok(AppendOutcome::Duplicate);
        }
        entries.push(record);
        Ok(AppendOutcome::Inserted)
    }

    async fn latest_settlement(&self, pool: &Address) -> AppResult<Option<SettlementRecord>> {
        let settlements = self.settlements.read().await;
        Ok(settlements.get(pool).and_then(|s| s.last()).cloned())
    }

    async fn append_payout(&self, settlement_id: Uuid, payout: PayoutRecord) -> AppResult<AppendOutcome> {
        let mut settlements = self.settlements.write().await;
        let record = settlements
            .values_mut()
            .flat_map(|entries| entries.iter_mut())
            .find(|s| s.id == settlement_id)
            .ok_or_else(|| AppError::NotFound(format!("Settlement {} not found", settlement_id)))?;

        if record.has_payout_for(&payout.member) {
            return Ok(AppendOutcome::Duplicate);
        }
        record.payouts.push(payout);
        Ok(AppendOutcome::Inserted)
    }

    async fn record_yield_withdrawal(&self, record: YieldWithdrawalRecord) -> AppResult<AppendOutcome> {
        let mut withdrawals = self.yield_withdrawals.write().await;
        let entries = withdrawals.entry(record.pool.clone()).or_default();
        let exists = entries
            .iter()
            .any(|w| w.tx_hash == record.tx_hash && w.asset == record.asset);
        if exists {
            return Ok(AppendOutcome::Duplicate);
        }
        entries.push(record);
        Ok(AppendOutcome::Inserted)
    }

    async fn yield_withdrawals(&self, pool: &Address) -> AppResult<Vec<YieldWithdrawalRecord>> {
        let withdrawals = self.yield_withdrawals.read().await;
        Ok(withdrawals.get(pool).cloned().unwrap_or_default())
    }

    async fn settlements_for_pool(&self, pool: &Address) -> AppResult<Vec<SettlementRecord>> {
        let settlements = self.settlements.read().await;
        Ok(settlements.get(pool).cloned().unwrap_or_default())
    }
}
