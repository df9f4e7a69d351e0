use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::PoolError;

/// Unix timestamp in seconds, as reported by the ledger
pub type Timestamp = i64;

/// Decimals used for base-unit amounts unless an asset says otherwise
pub const DEFAULT_DECIMALS: u32 = 18;

/// Largest scale a `Decimal` can carry
pub const MAX_DECIMALS: u32 = 28;

/// One whole token in base units at 18 decimals
pub const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;

/// Account address (wallet, pool, member or facility)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

/// Asset identifier: the token contract address, or `native`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    const NATIVE: &'static str = "native";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().to_lowercase())
    }

    /// The network's native asset
    pub fn native() -> Self {
        Self(Self::NATIVE.to_string())
    }

    pub fn is_native(&self) -> bool {
        self.0 == Self::NATIVE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(value: &str) -> Self {
        AssetId::new(value)
    }
}

/// Pool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Active,
    Completed,
    Cancelled,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Active => "active",
            PoolStatus::Completed => "completed",
            PoolStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Amount requested from the yield facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawAmount {
    Exact(u128),
    All,
}

/// Token movement leaving a pool or wallet, applied by the ledger host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub asset: AssetId,
    pub to: Address,
    pub amount: u128,
}

/// Convert base units to a decimal amount at the given number of decimals.
/// Fails with `Overflow` beyond 96 bits of mantissa.
pub fn to_decimal(amount: u128, decimals: u32) -> Result<Decimal, PoolError> {
    i128::try_from(amount)
        .ok()
        .and_then(|value| Decimal::try_from_i128_with_scale(value, decimals).ok())
        .map(|value| value.normalize())
        .ok_or(PoolError::Overflow)
}

/// Decimals per asset, falling back to `DEFAULT_DECIMALS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetDecimals(HashMap<AssetId, u32>);

impl AssetDecimals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, asset: AssetId, decimals: u32) -> Self {
        self.0.insert(asset, decimals);
        self
    }

    pub fn of(&self, asset: &AssetId) -> u32 {
        self.0.get(asset).copied().unwrap_or(DEFAULT_DECIMALS)
    }

    pub fn to_decimal(&self, asset: &AssetId, amount: u128) -> Result<Decimal, PoolError> {
        to_decimal(amount, self.of(asset))
    }

    /// Parse `asset:decimals` pairs separated by commas, e.g. `0xusdc:6,0xdai:18`
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut decimals = Self::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (asset, value) = entry
                .split_once(':')
                .ok_or_else(|| format!("expected asset:decimals, got '{}'", entry))?;
            let value: u32 = value
                .trim()
                .parse()
                .map_err(|_| format!("invalid decimals in '{}'", entry))?;
            if value > MAX_DECIMALS {
                return Err(format!("{} decimals for {} exceeds {}", value, asset.trim(), MAX_DECIMALS));
            }
            decimals.0.insert(AssetId::new(asset.trim()), value);
        }
        Ok(decimals)
    }
}

/// Convert a decimal amount to base units, truncating extra precision
pub fn to_base_units(amount: Decimal, decimals: u32) -> Option<u128> {
    if amount.is_sign_negative() {
        return None;
    }
    let factor = Decimal::from_i128_with_scale(10i128.checked_pow(decimals)?, 0);
    amount.checked_mul(factor)?.trunc().to_u128()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_addresses_are_case_insensitive() {
        assert_eq!(Address::new("0xABCDEF"), Address::from("0xabcdef"));
        assert_eq!(AssetId::new("0xUSDC"), AssetId::from("0xusdc"));
    }

    #[test]
    fn test_native_asset() {
        assert!(AssetId::native().is_native());
        assert!(!AssetId::new("0xusdc").is_native());
    }

    #[test]
    fn test_decimal_conversion() {
        assert_eq!(to_decimal(5_097_000_000_000_000_000, 18), Ok(dec!(5.097)));
        assert_eq!(to_decimal(0, 18), Ok(Decimal::ZERO));
        assert_eq!(to_base_units(dec!(0.01), 18), Some(10_000_000_000_000_000));
        assert_eq!(to_base_units(dec!(2.0388), 18), Some(2_038_800_000_000_000_000));
        assert_eq!(to_base_units(dec!(-1), 18), None);
    }

    #[test]
    fn test_decimal_conversion_out_of_range_is_an_error() {
        let max_mantissa = (1u128 << 96) - 1;
        assert!(to_decimal(max_mantissa, 18).is_ok());
        assert_eq!(to_decimal(1u128 << 96, 18), Err(PoolError::Overflow));
        assert_eq!(to_decimal(u128::MAX, 0), Err(PoolError::Overflow));
    }

    #[test]
    fn test_asset_decimals() {
        let usdc = AssetId::new("0xUSDC");
        let decimals = AssetDecimals::parse(" 0xusdc:6 , 0xwbtc:8").unwrap();
        assert_eq!(decimals.of(&usdc), 6);
        assert_eq!(decimals.of(&AssetId::native()), DEFAULT_DECIMALS);
        assert_eq!(decimals.to_decimal(&usdc, 5_100_000), Ok(dec!(5.1)));

        assert!(AssetDecimals::parse("").unwrap().0.is_empty());
        assert!(AssetDecimals::parse("0xusdc").is_err());
        assert!(AssetDecimals::parse("0xusdc:six").is_err());
        assert!(AssetDecimals::parse("0xusdc:29").is_err());
    }
}
