use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::chain::BlockNumber;
use crate::error::{AppError, AppResult};
use crate::pool::models::{Address, AssetDecimals};

pub const LOCAL_NETWORK: &str = "local";

/// Raw environment view; every key maps to its lowercased variable name
#[derive(Debug, Deserialize)]
struct EnvSettings {
    database_url: Option<String>,
    #[serde(default = "default_network")]
    network: String,
    chain_rpc_url: Option<String>,
    operator_address: Option<String>,
    fee_recipient: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_gas_margin_percent")]
    gas_margin_percent: u64,
    #[serde(default)]
    backfill_from_block: BlockNumber,
    asset_decimals: Option<String>,
}

fn default_network() -> String {
    LOCAL_NETWORK.to_string()
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_gas_margin_percent() -> u64 {
    20
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres mirror; the in-memory store is used when absent
    pub database_url: Option<String>,
    pub network: String,
    pub chain_rpc_url: Option<String>,
    pub operator_address: Address,
    /// Receives settlement fees and rounding dust; defaults to the operator
    pub fee_recipient: Address,
    pub poll_interval: Duration,
    pub gas_margin_percent: u64,
    pub backfill_from_block: BlockNumber,
    /// Per-asset decimals for mirrored amounts; unlisted assets use 18
    pub asset_decimals: AssetDecimals,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();
        Self::load(None)
    }

    /// Build from an explicit variable map instead of the process environment
    pub fn from_map(vars: HashMap<String, String>) -> AppResult<Self> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> AppResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true).source(vars))
            .build()?;
        let env: EnvSettings = settings.try_deserialize()?;

        let operator_address = env
            .operator_address
            .filter(|a| !a.trim().is_empty())
            .map(Address::new)
            .ok_or_else(|| AppError::Config("OPERATOR_ADDRESS must be set".to_string()))?;

        let network = env.network.trim().to_lowercase();
        let chain_rpc_url = env.chain_rpc_url.filter(|u| !u.trim().is_empty());
        if network != LOCAL_NETWORK && chain_rpc_url.is_none() {
            return Err(AppError::Config(format!(
                "CHAIN_RPC_URL must be set for network '{}'",
                network
            )));
        }

        if env.poll_interval_secs == 0 {
            return Err(AppError::Config(
                "POLL_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if env.gas_margin_percent > 1_000 {
            return Err(AppError::Config(format!(
                "GAS_MARGIN_PERCENT {} is out of range",
                env.gas_margin_percent
            )));
        }

        let asset_decimals = AssetDecimals::parse(env.asset_decimals.as_deref().unwrap_or(""))
            .map_err(|e| AppError::Config(format!("ASSET_DECIMALS: {}", e)))?;

        let fee_recipient = env
            .fee_recipient
            .filter(|a| !a.trim().is_empty())
            .map(Address::new)
            .unwrap_or_else(|| operator_address.clone());

        Ok(Self {
            database_url: env.database_url.filter(|u| !u.trim().is_empty()),
            network,
            chain_rpc_url,
            operator_address,
            fee_recipient,
            poll_interval: Duration::from_secs(env.poll_interval_secs),
            gas_margin_percent: env.gas_margin_percent,
            backfill_from_block: env.backfill_from_block,
            asset_decimals,
        })
    }

    pub fn is_local(&self) -> bool {
        self.network == LOCAL_NETWORK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::models::AssetId;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_map(vars(&[("OPERATOR_ADDRESS", "0xoperator")])).unwrap();
        assert!(config.is_local());
        assert!(config.database_url.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.gas_margin_percent, 20);
        assert_eq!(config.backfill_from_block, 0);
        assert_eq!(config.fee_recipient, Address::new("0xoperator"));
        assert_eq!(config.asset_decimals, AssetDecimals::new());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_map(vars(&[
            ("OPERATOR_ADDRESS", "0xoperator"),
            ("FEE_RECIPIENT", "0xtreasury"),
            ("NETWORK", "Sepolia"),
            ("CHAIN_RPC_URL", "http://localhost:8545"),
            ("POLL_INTERVAL_SECS", "60"),
            ("GAS_MARGIN_PERCENT", "35"),
            ("BACKFILL_FROM_BLOCK", "1200"),
            ("DATABASE_URL", "postgresql://localhost/pools"),
            ("ASSET_DECIMALS", "0xusdc:6,0xwbtc:8"),
        ]))
        .unwrap();

        assert!(!config.is_local());
        assert_eq!(config.network, "sepolia");
        assert_eq!(config.chain_rpc_url.as_deref(), Some("http://localhost:8545"));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.gas_margin_percent, 35);
        assert_eq!(config.backfill_from_block, 1200);
        assert_eq!(config.fee_recipient, Address::new("0xtreasury"));
        assert!(config.database_url.is_some());
        assert_eq!(config.asset_decimals.of(&AssetId::new("0xusdc")), 6);
        assert_eq!(config.asset_decimals.of(&AssetId::new("0xwbtc")), 8);
    }

    #[test]
    fn test_missing_operator_is_rejected() {
        let err = Config::from_map(HashMap::new()).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("OPERATOR_ADDRESS")));
    }

    #[test]
    fn test_remote_network_requires_rpc_url() {
        let err = Config::from_map(vars(&[
            ("OPERATOR_ADDRESS", "0xoperator"),
            ("NETWORK", "mainnet"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("CHAIN_RPC_URL")));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let zero_interval = Config::from_map(vars(&[
            ("OPERATOR_ADDRESS", "0xoperator"),
            ("POLL_INTERVAL_SECS", "0"),
        ]));
        assert!(matches!(zero_interval, Err(AppError::Config(_))));

        let garbage = Config::from_map(vars(&[
            ("OPERATOR_ADDRESS", "0xoperator"),
            ("GAS_MARGIN_PERCENT", "lots"),
        ]));
        assert!(matches!(garbage, Err(AppError::Config(_))));

        let bad_decimals = Config::from_map(vars(&[
            ("OPERATOR_ADDRESS", "0xoperator"),
            ("ASSET_DECIMALS", "0xusdc:40"),
        ]));
        assert!(matches!(bad_decimals, Err(AppError::Config(msg)) if msg.contains("ASSET_DECIMALS")));
    }
}
