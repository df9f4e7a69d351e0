use crate::pool::models::{Address, AssetId};
use thiserror::Error;

/// Top-level error type for the settlement engine
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Pool rule violation: {0}")]
    Pool(#[from] PoolError),

    #[error("Custody error: {0}")]
    Custody(#[from] CustodyError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Business-rule rejections surface as `{success: false}` outcomes
    /// instead of propagating as failures.
    pub fn is_business_rule(&self) -> bool {
        match self {
            AppError::Pool(_) | AppError::Custody(_) | AppError::Settlement(_) => true,
            AppError::Chain(err) => err.is_business_revert(),
            _ => false,
        }
    }
}

/// Precondition violations raised by the pool state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("{0} is not a member of the pool")]
    NotMember(Address),

    #[error("{0} is already a member of the pool")]
    DuplicateMember(Address),

    #[error("Contribution {amount} is below the minimum {minimum}")]
    BelowMinimum { amount: u128, minimum: u128 },

    #[error("No active window")]
    NoActiveWindow,

    #[error("Unsupported asset: {0}")]
    UnsupportedAsset(AssetId),

    #[error("Group is full ({max_members} members)")]
    GroupFull { max_members: u32 },

    #[error("{0} is not authorized for this operation")]
    NotAuthorized(Address),

    #[error("Pool is not active")]
    PoolNotActive,

    #[error("Lock period has elapsed, contributions are closed")]
    LockPeriodElapsed,

    #[error("Lock period has not elapsed yet (unlocks at {unlocks_at})")]
    LockPeriodNotElapsed { unlocks_at: i64 },

    #[error("Insufficient balance of {asset}: required {required}, available {available}")]
    InsufficientBalance {
        asset: AssetId,
        required: u128,
        available: u128,
    },

    #[error("Invalid pool parameters: {0}")]
    InvalidParameters(String),

    #[error("Pool already holds principal in custody")]
    PrincipalInCustody,

    #[error("{0} has recorded contributions and cannot be removed")]
    MemberHasContributions(Address),

    #[error("Amount overflow")]
    Overflow,
}

/// Yield custody errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error("No yield facility bound for {0}")]
    NoFacilityBinding(AssetId),

    #[error("No custody claim for {0}")]
    NoCustodyClaim(AssetId),

    #[error("Insufficient ledger balance of {asset}: required {required}, available {available}")]
    InsufficientBalance {
        asset: AssetId,
        required: u128,
        available: u128,
    },

    #[error("Facility rejected the operation: {0}")]
    FacilityRejected(String),
}

/// Settlement errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("Asset {asset} already settled for pool {pool}")]
    AlreadySettled { pool: Address, asset: AssetId },

    #[error("Nothing to settle for {0}")]
    NothingToSettle(AssetId),
}

/// Errors crossing the chain boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction reverted: {reason}")]
    Reverted { reason: String },

    #[error("Fee quote unavailable: {0}")]
    FeeQuoteUnavailable(String),

    #[error("Underpriced transaction: offered {offered}, required {required}")]
    Underpriced { offered: u128, required: u128 },

    #[error("Unknown pool: {0}")]
    UnknownPool(Address),
}

impl ChainError {
    /// Reverts caused by on-chain business rules; retrying cannot change the outcome.
    pub fn is_business_revert(&self) -> bool {
        matches!(self, ChainError::Reverted { .. } | ChainError::UnknownPool(_))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Internal(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_rule_classification() {
        let err: AppError = PoolError::NoActiveWindow.into();
        assert!(err.is_business_rule());

        let err: AppError = ChainError::Reverted {
            reason: "already settled".to_string(),
        }
        .into();
        assert!(err.is_business_rule());

        let err: AppError = ChainError::Rpc("connection reset".to_string()).into();
        assert!(!err.is_business_rule());

        let err = AppError::Config("OPERATOR_ADDRESS must be set".to_string());
        assert!(!err.is_business_rule());
    }
}
