use serde::{Deserialize, Serialize};

use crate::pool::models::{Address, AssetId, Timestamp};

/// Events emitted by pool accounts and the yield facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "PascalCase")]
pub enum PoolEvent {
    MemberAdded {
        pool: Address,
        member: Address,
        payout_address: Address,
    },
    MemberRemoved {
        pool: Address,
        member: Address,
    },
    WindowOpened {
        pool: Address,
        window: u32,
        start: Timestamp,
        end: Timestamp,
    },
    WindowCompleted {
        pool: Address,
        window: u32,
        totals: Vec<(AssetId, u128)>,
    },
    ContributionMade {
        pool: Address,
        member: Address,
        asset: AssetId,
        amount: u128,
        window: u32,
    },
    SuppliedToYield {
        asset: AssetId,
        amount: u128,
    },
    /// `asset` may be absent in payloads from older pool deployments
    WithdrawnFromYield {
        asset: Option<AssetId>,
        amount: u128,
    },
    /// Emitted by the facility itself, not the pool
    FacilityWithdrawal {
        holder: Address,
        asset: AssetId,
        amount: u128,
    },
    SettlementProcessed {
        pool: Address,
        asset: AssetId,
        total_amount: u128,
        principal: u128,
        interest: u128,
        fee: u128,
        timestamp: Timestamp,
    },
    MemberPayout {
        pool: Address,
        asset: AssetId,
        member: Address,
        amount: u128,
        contribution: u128,
        timestamp: Timestamp,
    },
    PoolCompleted {
        pool: Address,
        timestamp: Timestamp,
    },
    PoolCancelled {
        pool: Address,
        timestamp: Timestamp,
    },
}

/// Discriminant used to filter subscriptions and log queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    MemberAdded,
    MemberRemoved,
    WindowOpened,
    WindowCompleted,
    ContributionMade,
    SuppliedToYield,
    WithdrawnFromYield,
    FacilityWithdrawal,
    SettlementProcessed,
    MemberPayout,
    PoolCompleted,
    PoolCancelled,
}

impl EventKind {
    /// The four kinds the reconciliation listener projects into the mirror
    pub const SETTLEMENT_KINDS: [EventKind; 4] = [
        EventKind::SettlementProcessed,
        EventKind::MemberPayout,
        EventKind::PoolCompleted,
        EventKind::WithdrawnFromYield,
    ];
}

impl PoolEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PoolEvent::MemberAdded { .. } => EventKind::MemberAdded,
            PoolEvent::MemberRemoved { .. } => EventKind::MemberRemoved,
            PoolEvent::WindowOpened { .. } => EventKind::WindowOpened,
            PoolEvent::WindowCompleted { .. } => EventKind::WindowCompleted,
            PoolEvent::ContributionMade { .. } => EventKind::ContributionMade,
            PoolEvent::SuppliedToYield { .. } => EventKind::SuppliedToYield,
            PoolEvent::WithdrawnFromYield { .. } => EventKind::WithdrawnFromYield,
            PoolEvent::FacilityWithdrawal { .. } => EventKind::FacilityWithdrawal,
            PoolEvent::SettlementProcessed { .. } => EventKind::SettlementProcessed,
            PoolEvent::MemberPayout { .. } => EventKind::MemberPayout,
            PoolEvent::PoolCompleted { .. } => EventKind::PoolCompleted,
            PoolEvent::PoolCancelled { .. } => EventKind::PoolCancelled,
        }
    }

    pub fn is_settlement_kind(&self) -> bool {
        EventKind::SETTLEMENT_KINDS.contains(&self.kind())
    }
}
