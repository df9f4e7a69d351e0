use std::collections::HashMap;

use crate::error::PoolError;
use crate::pool::models::AssetId;

/// Per-wallet balance book with an allow list of assets
///
/// The allow list keeps insertion order; settlement walks assets in that
/// order so replays produce identical event sequences.
#[derive(Debug, Clone, Default)]
pub struct AssetLedger {
    allowed: Vec<AssetId>,
    balances: HashMap<AssetId, u128>,
}

impl AssetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets<I>(assets: I) -> Self
    where
        I: IntoIterator<Item = AssetId>,
    {
        let mut ledger = Self::new();
        for asset in assets {
            ledger.allow(asset);
        }
        ledger
    }

    /// Add an asset to the allow list; returns false if it was already there
    pub fn allow(&mut self, asset: AssetId) -> bool {
        if self.allowed.contains(&asset) {
            return false;
        }
        self.allowed.push(asset);
        true
    }

    /// Remove an asset from the allow list. Assets with a balance stay listed.
    pub fn disallow(&mut self, asset: &AssetId) -> Result<(), PoolError> {
        if self.balance(asset) > 0 {
            return Err(PoolError::InvalidParameters(format!(
                "cannot delist {} while holding a balance",
                asset
            )));
        }
        self.allowed.retain(|a| a != asset);
        Ok(())
    }

    pub fn is_allowed(&self, asset: &AssetId) -> bool {
        self.allowed.contains(asset)
    }

    pub fn allowed_assets(&self) -> &[AssetId] {
        &self.allowed
    }

    pub fn balance(&self, asset: &AssetId) -> u128 {
        self.balances.get(asset).copied().unwrap_or(0)
    }

    pub fn ensure_allowed(&self, asset: &AssetId) -> Result<(), PoolError> {
        if !self.is_allowed(asset) {
            return Err(PoolError::UnsupportedAsset(asset.clone()));
        }
        Ok(())
    }

    pub fn credit(&mut self, asset: &AssetId, amount: u128) -> Result<u128, PoolError> {
        self.ensure_allowed(asset)?;
        let updated = self
            .balance(asset)
            .checked_add(amount)
            .ok_or(PoolError::Overflow)?;
        self.balances.insert(asset.clone(), updated);
        Ok(updated)
    }

    pub fn debit(&mut self, asset: &AssetId, amount: u128) -> Result<u128, PoolError> {
        let available = self.balance(asset);
        if available < amount {
            return Err(PoolError::InsufficientBalance {
                asset: asset.clone(),
                required: amount,
                available,
            });
        }
        let updated = available - amount;
        self.balances.insert(asset.clone(), updated);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> AssetId {
        AssetId::new("0xusdc")
    }

    #[test]
    fn test_credit_requires_allowed_asset() {
        let mut ledger = AssetLedger::new();
        assert_eq!(
            ledger.credit(&usdc(), 10),
            Err(PoolError::UnsupportedAsset(usdc()))
        );

        ledger.allow(usdc());
        assert_eq!(ledger.credit(&usdc(), 10), Ok(10));
        assert_eq!(ledger.balance(&usdc()), 10);
    }

    #[test]
    fn test_debit_never_goes_negative() {
        let mut ledger = AssetLedger::with_assets([usdc()]);
        ledger.credit(&usdc(), 10).unwrap();

        let err = ledger.debit(&usdc(), 11).unwrap_err();
        assert!(matches!(err, PoolError::InsufficientBalance { available: 10, .. }));
        assert_eq!(ledger.balance(&usdc()), 10);

        assert_eq!(ledger.debit(&usdc(), 10), Ok(0));
    }

    #[test]
    fn test_allow_list_keeps_order_and_rejects_duplicates() {
        let mut ledger = AssetLedger::with_assets([AssetId::native(), usdc()]);
        assert!(!ledger.allow(usdc()));
        assert_eq!(ledger.allowed_assets(), &[AssetId::native(), usdc()]);

        ledger.credit(&usdc(), 1).unwrap();
        assert!(ledger.disallow(&usdc()).is_err());
        assert!(ledger.disallow(&AssetId::native()).is_ok());
        assert_eq!(ledger.allowed_assets(), &[usdc()]);
    }
}
