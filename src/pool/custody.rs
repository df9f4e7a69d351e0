use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::error::CustodyError;
use crate::pool::events::PoolEvent;
use crate::pool::ledger::AssetLedger;
use crate::pool::models::{Address, AssetId, WithdrawAmount};

/// External yield-bearing facility issuing receipt tokens
pub trait YieldFacility {
    fn supply(&mut self, holder: &Address, asset: &AssetId, amount: u128) -> Result<(), CustodyError>;

    /// Returns the amount actually paid out to the holder
    fn withdraw(
        &mut self,
        holder: &Address,
        asset: &AssetId,
        amount: WithdrawAmount,
    ) -> Result<u128, CustodyError>;

    fn receipt_balance(&self, holder: &Address, asset: &AssetId) -> u128;
}

/// Observed yield position for one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YieldPosition {
    pub asset: AssetId,
    pub principal_supplied: u128,
    pub receipt_balance: u128,
    pub accrued_yield: u128,
}

/// Tracks principal a wallet has placed with its yield facility
#[derive(Debug, Clone)]
pub struct YieldCustody {
    holder: Address,
    bound_assets: Vec<AssetId>,
    principal: HashMap<AssetId, u128>,
}

impl YieldCustody {
    pub fn new(holder: Address, bound_assets: Vec<AssetId>) -> Self {
        Self {
            holder,
            bound_assets,
            principal: HashMap::new(),
        }
    }

    pub fn is_bound(&self, asset: &AssetId) -> bool {
        self.bound_assets.contains(asset)
    }

    pub fn bound_assets(&self) -> &[AssetId] {
        &self.bound_assets
    }

    pub fn principal_supplied(&self, asset: &AssetId) -> u128 {
        self.principal.get(asset).copied().unwrap_or(0)
    }

    /// Move `amount` from the ledger into the facility
    pub fn supply(
        &mut self,
        ledger: &mut AssetLedger,
        facility: &mut dyn YieldFacility,
        asset: &AssetId,
        amount: u128,
    ) -> Result<PoolEvent, CustodyError> {
        if !self.is_bound(asset) {
            return Err(CustodyError::NoFacilityBinding(asset.clone()));
        }

        let available = ledger.balance(asset);
        if available < amount {
            return Err(CustodyError::InsufficientBalance {
                asset: asset.clone(),
                required: amount,
                available,
            });
        }

        facility.supply(&self.holder, asset, amount)?;
        ledger
            .debit(asset, amount)
            .map_err(|e| CustodyError::FacilityRejected(e.to_string()))?;

        let principal = self.principal.entry(asset.clone()).or_insert(0);
        *principal = principal.saturating_add(amount);

        debug!(
            "Supplied {} of {} to yield (principal now {})",
            amount, asset, principal
        );

        Ok(PoolEvent::SuppliedToYield {
            asset: asset.clone(),
            amount,
        })
    }

    /// Pull funds back from the facility into the ledger
    pub fn withdraw(
        &mut self,
        ledger: &mut AssetLedger,
        facility: &mut dyn YieldFacility,
        asset: &AssetId,
        amount: WithdrawAmount,
    ) -> Result<(u128, PoolEvent), CustodyError> {
        if facility.receipt_balance(&self.holder, asset) == 0 {
            return Err(CustodyError::NoCustodyClaim(asset.clone()));
        }
        ledger
            .ensure_allowed(asset)
            .map_err(|e| CustodyError::FacilityRejected(e.to_string()))?;

        let received = facility.withdraw(&self.holder, asset, amount)?;

        let principal = self.principal_supplied(asset);
        let remaining = match amount {
            WithdrawAmount::All => 0,
            WithdrawAmount::Exact(requested) if requested >= principal => 0,
            WithdrawAmount::Exact(requested) => principal - requested,
        };
        self.principal.insert(asset.clone(), remaining);

        ledger
            .credit(asset, received)
            .map_err(|e| CustodyError::FacilityRejected(e.to_string()))?;

        Ok((
            received,
            PoolEvent::WithdrawnFromYield {
                asset: Some(asset.clone()),
                amount: received,
            },
        ))
    }

    /// Yield accrued on top of principal, floored at zero
    pub fn yield_of(&self, facility: &dyn YieldFacility, asset: &AssetId) -> u128 {
        facility
            .receipt_balance(&self.holder, asset)
            .saturating_sub(self.principal_supplied(asset))
    }

    pub fn position(&self, facility: &dyn YieldFacility, asset: &AssetId) -> YieldPosition {
        YieldPosition {
            asset: asset.clone(),
            principal_supplied: self.principal_supplied(asset),
            receipt_balance: facility.receipt_balance(&self.holder, asset),
            accrued_yield: self.yield_of(facility, asset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::facility::LendingFacility;

    fn setup() -> (YieldCustody, AssetLedger, LendingFacility, AssetId) {
        let asset = AssetId::new("0xusdc");
        let custody = YieldCustody::new(Address::new("0xpool"), vec![asset.clone()]);
        let mut ledger = AssetLedger::with_assets([asset.clone(), AssetId::native()]);
        ledger.credit(&asset, 1_000).unwrap();
        (custody, ledger, LendingFacility::new(), asset)
    }

    #[test]
    fn test_supply_requires_binding() {
        let (mut custody, mut ledger, mut facility, _) = setup();
        ledger.credit(&AssetId::native(), 10).unwrap();

        let err = custody
            .supply(&mut ledger, &mut facility, &AssetId::native(), 10)
            .unwrap_err();
        assert_eq!(err, CustodyError::NoFacilityBinding(AssetId::native()));
        assert_eq!(ledger.balance(&AssetId::native()), 10);
    }

    #[test]
    fn test_supply_requires_balance() {
        let (mut custody, mut ledger, mut facility, asset) = setup();
        let err = custody
            .supply(&mut ledger, &mut facility, &asset, 1_001)
            .unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientBalance { .. }));
        assert_eq!(custody.principal_supplied(&asset), 0);
        assert_eq!(facility.receipt_balance(&Address::new("0xpool"), &asset), 0);
    }

    #[test]
    fn test_yield_is_never_negative() {
        let (mut custody, mut ledger, mut facility, asset) = setup();
        let holder = Address::new("0xpool");
        custody.supply(&mut ledger, &mut facility, &asset, 600).unwrap();

        facility.accrue(&holder, &asset, 25);
        assert_eq!(custody.yield_of(&facility, &asset), 25);

        facility.haircut(&holder, &asset, 100);
        assert_eq!(facility.receipt_balance(&holder, &asset), 525);
        assert_eq!(custody.yield_of(&facility, &asset), 0);
    }

    #[test]
    fn test_partial_then_full_withdraw() {
        let (mut custody, mut ledger, mut facility, asset) = setup();
        custody.supply(&mut ledger, &mut facility, &asset, 600).unwrap();
        assert_eq!(ledger.balance(&asset), 400);

        let (received, _) = custody
            .withdraw(&mut ledger, &mut facility, &asset, WithdrawAmount::Exact(100))
            .unwrap();
        assert_eq!(received, 100);
        assert_eq!(custody.principal_supplied(&asset), 500);

        facility.accrue(&Address::new("0xpool"), &asset, 50);
        let (received, event) = custody
            .withdraw(&mut ledger, &mut facility, &asset, WithdrawAmount::All)
            .unwrap();
        assert_eq!(received, 550);
        assert_eq!(custody.principal_supplied(&asset), 0);
        assert_eq!(ledger.balance(&asset), 1_050);
        assert_eq!(
            event,
            PoolEvent::WithdrawnFromYield {
                asset: Some(asset.clone()),
                amount: 550
            }
        );
    }

    #[test]
    fn test_withdraw_without_claim_fails() {
        let (mut custody, mut ledger, mut facility, asset) = setup();
        let err = custody
            .withdraw(&mut ledger, &mut facility, &asset, WithdrawAmount::All)
            .unwrap_err();
        assert_eq!(err, CustodyError::NoCustodyClaim(asset));
    }
}
