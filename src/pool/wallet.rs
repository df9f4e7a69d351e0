use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{AppResult, PoolError};
use crate::pool::account::{PoolAccount, PoolParams};
use crate::pool::custody::{YieldCustody, YieldFacility};
use crate::pool::events::PoolEvent;
use crate::pool::ledger::AssetLedger;
use crate::pool::models::{Address, AssetId, Timestamp, Transfer, WithdrawAmount};
use crate::pool::payout::PROTOCOL_FEE_BPS;

/// Behaviour shared by every wallet and pool the factory creates
#[derive(Debug, Clone)]
pub struct WalletBehavior {
    pub fee_bps: u128,
    pub fee_recipient: Address,
    /// Assets with a yield facility binding
    pub facility_assets: Vec<AssetId>,
    /// Allow list applied to new wallets
    pub default_assets: Vec<AssetId>,
}

impl WalletBehavior {
    pub fn new(fee_recipient: Address) -> Self {
        Self {
            fee_bps: PROTOCOL_FEE_BPS,
            fee_recipient,
            facility_assets: Vec::new(),
            default_assets: vec![AssetId::native()],
        }
    }

    /// Allow-list an asset and bind it to the yield facility
    pub fn with_facility_asset(mut self, asset: AssetId) -> Self {
        if !self.default_assets.contains(&asset) {
            self.default_assets.push(asset.clone());
        }
        if !self.facility_assets.contains(&asset) {
            self.facility_assets.push(asset);
        }
        self
    }

    pub fn with_asset(mut self, asset: AssetId) -> Self {
        if !self.default_assets.contains(&asset) {
            self.default_assets.push(asset);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    Personal,
    Pool,
}

/// Per-entity state record; behaviour lives in the shared `WalletBehavior`
#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: Address,
    pub owner: Address,
    pub kind: WalletKind,
    pub ledger: AssetLedger,
    pub custody: Option<YieldCustody>,
    behavior: Arc<WalletBehavior>,
}

impl Wallet {
    pub fn behavior(&self) -> &WalletBehavior {
        &self.behavior
    }

    pub fn balance(&self, asset: &AssetId) -> u128 {
        self.ledger.balance(asset)
    }

    pub fn deposit(&mut self, asset: &AssetId, amount: u128) -> AppResult<u128> {
        Ok(self.ledger.credit(asset, amount)?)
    }

    /// Owner-only withdrawal to an external address
    pub fn withdraw(
        &mut self,
        caller: &Address,
        asset: &AssetId,
        amount: u128,
        to: Address,
    ) -> AppResult<Transfer> {
        if caller != &self.owner {
            return Err(PoolError::NotAuthorized(caller.clone()).into());
        }
        self.ledger.debit(asset, amount)?;
        Ok(Transfer {
            asset: asset.clone(),
            to,
            amount,
        })
    }

    /// Owner-only supply of idle balance into the yield facility
    pub fn supply_to_yield(
        &mut self,
        caller: &Address,
        facility: &mut dyn YieldFacility,
        asset: &AssetId,
        amount: u128,
    ) -> AppResult<PoolEvent> {
        if caller != &self.owner {
            return Err(PoolError::NotAuthorized(caller.clone()).into());
        }
        let custody = self
            .custody
            .as_mut()
            .ok_or_else(|| crate::error::CustodyError::NoFacilityBinding(asset.clone()))?;
        Ok(custody.supply(&mut self.ledger, facility, asset, amount)?)
    }

    /// Owner-only pull of supplied funds back into the wallet ledger.
    /// Returns the amount received and the withdrawal event.
    pub fn withdraw_from_yield(
        &mut self,
        caller: &Address,
        facility: &mut dyn YieldFacility,
        asset: &AssetId,
        amount: WithdrawAmount,
    ) -> AppResult<(u128, PoolEvent)> {
        if caller != &self.owner {
            return Err(PoolError::NotAuthorized(caller.clone()).into());
        }
        let custody = self
            .custody
            .as_mut()
            .ok_or_else(|| crate::error::CustodyError::NoFacilityBinding(asset.clone()))?;
        Ok(custody.withdraw(&mut self.ledger, facility, asset, amount)?)
    }
}

/// Creates wallets and pools that all reference one behaviour instance
#[derive(Debug)]
pub struct WalletFactory {
    behavior: Arc<WalletBehavior>,
    nonce: u64,
}

impl WalletFactory {
    pub fn new(behavior: WalletBehavior) -> Self {
        Self {
            behavior: Arc::new(behavior),
            nonce: 0,
        }
    }

    pub fn behavior(&self) -> Arc<WalletBehavior> {
        self.behavior.clone()
    }

    /// Deterministic address from creator, kind and factory nonce
    fn next_address(&mut self, creator: &Address, kind: WalletKind) -> Address {
        self.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(creator.as_str().as_bytes());
        hasher.update([kind as u8]);
        hasher.update(self.nonce.to_be_bytes());
        let digest = hasher.finalize();
        Address::new(format!("0x{}", hex::encode(&digest[..20])))
    }

    fn new_wallet(&mut self, owner: Address, kind: WalletKind) -> Wallet {
        let address = self.next_address(&owner, kind);
        let custody = YieldCustody::new(address.clone(), self.behavior.facility_assets.clone());
        Wallet {
            address,
            owner,
            kind,
            ledger: AssetLedger::with_assets(self.behavior.default_assets.iter().cloned()),
            custody: Some(custody),
            behavior: self.behavior.clone(),
        }
    }

    pub fn create_personal_wallet(&mut self, owner: Address) -> Wallet {
        self.new_wallet(owner, WalletKind::Personal)
    }

    pub fn create_pool(&mut self, params: PoolParams, now: Timestamp) -> AppResult<PoolAccount> {
        params.validate()?;
        let mut wallet = self.new_wallet(params.owner.clone(), WalletKind::Pool);
        for asset in &params.extra_assets {
            wallet.ledger.allow(asset.clone());
        }
        Ok(PoolAccount::new(wallet, params, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::facility::LendingFacility;

    fn factory() -> WalletFactory {
        WalletFactory::new(
            WalletBehavior::new(Address::new("0xtreasury"))
                .with_facility_asset(AssetId::native()),
        )
    }

    #[test]
    fn test_wallets_share_one_behavior() {
        let mut factory = factory();
        let a = factory.create_personal_wallet(Address::new("0xalice"));
        let b = factory.create_personal_wallet(Address::new("0xalice"));

        assert_ne!(a.address, b.address);
        assert!(Arc::ptr_eq(&a.behavior, &b.behavior));
        assert_eq!(a.behavior().fee_bps, PROTOCOL_FEE_BPS);
    }

    #[test]
    fn test_personal_wallet_withdraw_is_owner_only() {
        let mut factory = factory();
        let owner = Address::new("0xalice");
        let mut wallet = factory.create_personal_wallet(owner.clone());
        wallet.deposit(&AssetId::native(), 50).unwrap();

        let err = wallet
            .withdraw(&Address::new("0xmallory"), &AssetId::native(), 10, owner.clone())
            .unwrap_err();
        assert!(matches!(err, crate::error::AppError::Pool(PoolError::NotAuthorized(_))));

        let transfer = wallet
            .withdraw(&owner, &AssetId::native(), 10, owner.clone())
            .unwrap();
        assert_eq!(transfer.amount, 10);
        assert_eq!(wallet.balance(&AssetId::native()), 40);
    }

    #[test]
    fn test_personal_wallet_yield_position() {
        let mut factory = factory();
        let owner = Address::new("0xalice");
        let mut wallet = factory.create_personal_wallet(owner.clone());
        let mut facility = LendingFacility::new();
        wallet.deposit(&AssetId::native(), 100).unwrap();

        wallet
            .supply_to_yield(&owner, &mut facility, &AssetId::native(), 60)
            .unwrap();
        facility.accrue(&wallet.address, &AssetId::native(), 6);

        let position = wallet
            .custody
            .as_ref()
            .unwrap()
            .position(&facility, &AssetId::native());
        assert_eq!(position.principal_supplied, 60);
        assert_eq!(position.accrued_yield, 6);
        assert_eq!(wallet.balance(&AssetId::native()), 40);
    }

    #[test]
    fn test_personal_wallet_yield_withdrawal() {
        let mut factory = factory();
        let owner = Address::new("0xalice");
        let native = AssetId::native();
        let mut wallet = factory.create_personal_wallet(owner.clone());
        let mut facility = LendingFacility::new();
        wallet.deposit(&native, 100).unwrap();
        wallet.supply_to_yield(&owner, &mut facility, &native, 60).unwrap();
        facility.accrue(&wallet.address, &native, 6);

        let err = wallet
            .withdraw_from_yield(&Address::new("0xmallory"), &mut facility, &native, WithdrawAmount::All)
            .unwrap_err();
        assert!(matches!(err, crate::error::AppError::Pool(PoolError::NotAuthorized(_))));

        // partial: principal shrinks by the requested amount
        let (received, event) = wallet
            .withdraw_from_yield(&owner, &mut facility, &native, WithdrawAmount::Exact(20))
            .unwrap();
        assert_eq!(received, 20);
        assert_eq!(
            event,
            PoolEvent::WithdrawnFromYield {
                asset: Some(native.clone()),
                amount: 20,
            }
        );
        let custody = wallet.custody.as_ref().unwrap();
        assert_eq!(custody.principal_supplied(&native), 40);
        assert_eq!(wallet.balance(&native), 60);

        // full: principal clears and the remaining receipt comes home
        let (received, _) = wallet
            .withdraw_from_yield(&owner, &mut facility, &native, WithdrawAmount::All)
            .unwrap();
        assert_eq!(received, 46);
        assert_eq!(wallet.custody.as_ref().unwrap().principal_supplied(&native), 0);
        assert_eq!(facility.receipt_balance(&wallet.address, &native), 0);
        assert_eq!(wallet.balance(&native), 106);
    }
}
