pub mod account;
pub mod custody;
pub mod events;
pub mod ledger;
pub mod models;
pub mod payout;
pub mod wallet;
pub mod window;

pub use account::{Member, PoolAccount, PoolParams, SettlementOutcome};
pub use custody::{YieldCustody, YieldFacility, YieldPosition};
pub use events::{EventKind, PoolEvent};
pub use ledger::AssetLedger;
pub use models::*;
pub use payout::{allocate_payouts, compute_settlement, PROTOCOL_FEE_BPS};
pub use wallet::{Wallet, WalletBehavior, WalletFactory, WalletKind};
pub use window::{PaymentWindow, WindowManager};
