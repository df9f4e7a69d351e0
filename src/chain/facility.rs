use std::collections::HashMap;

use tracing::debug;

use crate::error::CustodyError;
use crate::pool::custody::YieldFacility;
use crate::pool::events::PoolEvent;
use crate::pool::models::{Address, AssetId, WithdrawAmount};

/// Lending-market style facility: supplied funds mint receipt tokens 1:1
/// and the receipt balance grows as interest accrues.
#[derive(Debug, Clone, Default)]
pub struct LendingFacility {
    receipts: HashMap<(Address, AssetId), u128>,
    pending_events: Vec<PoolEvent>,
}

impl LendingFacility {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit interest to a holder's receipt balance
    pub fn accrue(&mut self, holder: &Address, asset: &AssetId, interest: u128) {
        let balance = self
            .receipts
            .entry((holder.clone(), asset.clone()))
            .or_insert(0);
        *balance = balance.saturating_add(interest);
        debug!("Accrued {} {} for {}", interest, asset, holder);
    }

    /// Reduce a receipt balance (facility-side loss)
    pub fn haircut(&mut self, holder: &Address, asset: &AssetId, loss: u128) {
        if let Some(balance) = self.receipts.get_mut(&(holder.clone(), asset.clone())) {
            *balance = balance.saturating_sub(loss);
        }
    }

    /// Logs produced since the last call, in emission order
    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

impl YieldFacility for LendingFacility {
    fn supply(&mut self, holder: &Address, asset: &AssetId, amount: u128) -> Result<(), CustodyError> {
        if amount == 0 {
            return Err(CustodyError::FacilityRejected(
                "supply amount must be positive".to_string(),
            ));
        }
        let balance = self
            .receipts
            .entry((holder.clone(), asset.clone()))
            .or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| CustodyError::FacilityRejected("receipt overflow".to_string()))?;
        Ok(())
    }

    fn withdraw(
        &mut self,
        holder: &Address,
        asset: &AssetId,
        amount: WithdrawAmount,
    ) -> Result<u128, CustodyError> {
        let key = (holder.clone(), asset.clone());
        let balance = self.receipts.get(&key).copied().unwrap_or(0);
        if balance == 0 {
            return Err(CustodyError::NoCustodyClaim(asset.clone()));
        }

        let paid = match amount {
            WithdrawAmount::All => balance,
            WithdrawAmount::Exact(requested) => requested.min(balance),
        };
        self.receipts.insert(key, balance - paid);

        self.pending_events.push(PoolEvent::FacilityWithdrawal {
            holder: holder.clone(),
            asset: asset.clone(),
            amount: paid,
        });

        Ok(paid)
    }

    fn receipt_balance(&self, holder: &Address, asset: &AssetId) -> u128 {
        self.receipts
            .get(&(holder.clone(), asset.clone()))
            .copied()
            .unwrap_or(0)
    }
}
