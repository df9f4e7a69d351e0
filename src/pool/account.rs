//! Pool account state machine.
//!
//! A `PoolAccount` owns the pool wallet (ledger + yield custody), the
//! ordered member set and the payment windows. Every operation validates
//! all of its preconditions before it writes anything, so a rejected call
//! leaves the account untouched. Operations that can touch the yield
//! facility part-way (window roll-over, settlement) are made atomic by the
//! ledger host, which runs them against a scratch copy.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AppResult, PoolError, SettlementError};
use crate::pool::custody::{YieldCustody, YieldFacility, YieldPosition};
use crate::pool::events::PoolEvent;
use crate::pool::ledger::AssetLedger;
use crate::pool::models::{Address, AssetId, PoolStatus, Timestamp, Transfer, WithdrawAmount};
use crate::pool::payout::{
    allocate_payouts, compute_settlement, MemberShare, PayoutAllocation, SettlementAmounts,
};
use crate::pool::wallet::Wallet;
use crate::pool::window::WindowManager;

/// Creation parameters for a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolParams {
    pub name: String,
    pub owner: Address,
    /// Seconds each payment window stays open
    pub window_duration: i64,
    pub min_contribution: u128,
    pub max_members: u32,
    /// Seconds from creation until the pool may settle
    pub lock_period: i64,
    /// Assets allow-listed on top of the factory defaults
    pub extra_assets: Vec<AssetId>,
}

impl PoolParams {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::InvalidParameters("name must not be empty".to_string()));
        }
        if self.window_duration <= 0 {
            return Err(PoolError::InvalidParameters(
                "window duration must be positive".to_string(),
            ));
        }
        if self.max_members == 0 {
            return Err(PoolError::InvalidParameters(
                "max members must be at least 1".to_string(),
            ));
        }
        if self.lock_period < 0 {
            return Err(PoolError::InvalidParameters(
                "lock period must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub address: Address,
    pub payout_address: Address,
    pub joined_at: Timestamp,
}

/// Everything one `settle_asset` call did
#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub asset: AssetId,
    pub amounts: SettlementAmounts,
    pub allocation: PayoutAllocation,
    pub transfers: Vec<Transfer>,
    pub events: Vec<PoolEvent>,
    pub pool_completed: bool,
}

#[derive(Debug, Clone)]
pub struct PoolAccount {
    wallet: Wallet,
    custody: YieldCustody,
    name: String,
    managers: Vec<Address>,
    members: Vec<Member>,
    min_contribution: u128,
    max_members: u32,
    created_at: Timestamp,
    lock_until: Timestamp,
    status: PoolStatus,
    windows: WindowManager,
    settled_assets: Vec<AssetId>,
}

impl PoolAccount {
    pub(crate) fn new(mut wallet: Wallet, params: PoolParams, now: Timestamp) -> Self {
        let custody = wallet
            .custody
            .take()
            .unwrap_or_else(|| YieldCustody::new(wallet.address.clone(), Vec::new()));

        Self {
            wallet,
            custody,
            name: params.name,
            managers: Vec::new(),
            members: Vec::new(),
            min_contribution: params.min_contribution,
            max_members: params.max_members,
            created_at: now,
            lock_until: now.saturating_add(params.lock_period),
            status: PoolStatus::Active,
            windows: WindowManager::new(params.window_duration),
            settled_assets: Vec::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.wallet.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &Address {
        &self.wallet.owner
    }

    pub fn status(&self) -> PoolStatus {
        self.status
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn lock_until(&self) -> Timestamp {
        self.lock_until
    }

    pub fn lock_period(&self) -> i64 {
        self.lock_until - self.created_at
    }

    pub fn min_contribution(&self) -> u128 {
        self.min_contribution
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn ledger(&self) -> &AssetLedger {
        &self.wallet.ledger
    }

    pub fn custody(&self) -> &YieldCustody {
        &self.custody
    }

    pub fn settled_assets(&self) -> &[AssetId] {
        &self.settled_assets
    }

    pub fn is_member(&self, address: &Address) -> bool {
        self.members.iter().any(|m| &m.address == address)
    }

    pub fn is_manager(&self, address: &Address) -> bool {
        address == self.owner() || self.managers.contains(address)
    }

    pub fn is_lock_elapsed(&self, now: Timestamp) -> bool {
        now >= self.lock_until
    }

    fn ensure_active(&self) -> Result<(), PoolError> {
        if self.status != PoolStatus::Active {
            return Err(PoolError::PoolNotActive);
        }
        Ok(())
    }

    fn ensure_manager(&self, caller: &Address) -> Result<(), PoolError> {
        if !self.is_manager(caller) {
            return Err(PoolError::NotAuthorized(caller.clone()));
        }
        Ok(())
    }

    pub fn add_manager(&mut self, caller: &Address, manager: Address) -> AppResult<()> {
        if caller != self.owner() {
            return Err(PoolError::NotAuthorized(caller.clone()).into());
        }
        if !self.managers.contains(&manager) {
            self.managers.push(manager);
        }
        Ok(())
    }

    pub fn add_member(
        &mut self,
        caller: &Address,
        member: Address,
        payout_address: Address,
        now: Timestamp,
    ) -> AppResult<PoolEvent> {
        self.ensure_active()?;
        self.ensure_manager(caller)?;
        if self.is_member(&member) {
            return Err(PoolError::DuplicateMember(member).into());
        }
        if self.members.len() as u32 >= self.max_members {
            return Err(PoolError::GroupFull {
                max_members: self.max_members,
            }
            .into());
        }

        self.members.push(Member {
            address: member.clone(),
            payout_address: payout_address.clone(),
            joined_at: now,
        });
        debug!("Member {} joined pool {}", member, self.address());

        Ok(PoolEvent::MemberAdded {
            pool: self.address().clone(),
            member,
            payout_address,
        })
    }

    pub fn remove_member(&mut self, caller: &Address, member: &Address) -> AppResult<PoolEvent> {
        self.ensure_active()?;
        self.ensure_manager(caller)?;
        let index = self
            .members
            .iter()
            .position(|m| &m.address == member)
            .ok_or_else(|| PoolError::NotMember(member.clone()))?;

        let has_history = self
            .windows
            .contributed_assets()
            .iter()
            .any(|asset| self.windows.member_contribution(member, asset) > 0);
        if has_history {
            return Err(PoolError::MemberHasContributions(member.clone()).into());
        }

        self.members.remove(index);
        Ok(PoolEvent::MemberRemoved {
            pool: self.address().clone(),
            member: member.clone(),
        })
    }

    pub fn pause_windows(&mut self, caller: &Address) -> AppResult<()> {
        self.ensure_manager(caller)?;
        self.windows.set_paused(true);
        Ok(())
    }

    pub fn resume_windows(&mut self, caller: &Address) -> AppResult<()> {
        self.ensure_manager(caller)?;
        self.windows.set_paused(false);
        Ok(())
    }

    /// Record a member contribution, rolling the window over if it expired
    pub fn contribute(
        &mut self,
        caller: &Address,
        asset: &AssetId,
        amount: u128,
        now: Timestamp,
        facility: &mut dyn YieldFacility,
    ) -> AppResult<Vec<PoolEvent>> {
        self.ensure_active()?;
        if self.is_lock_elapsed(now) {
            return Err(PoolError::LockPeriodElapsed.into());
        }
        if !self.is_member(caller) {
            return Err(PoolError::NotMember(caller.clone()).into());
        }
        self.wallet.ledger.ensure_allowed(asset)?;
        if amount < self.min_contribution {
            return Err(PoolError::BelowMinimum {
                amount,
                minimum: self.min_contribution,
            }
            .into());
        }

        let needs_window = self
            .windows
            .active_window()
            .map(|w| w.has_expired(now))
            .unwrap_or(true);
        if needs_window && self.windows.is_paused() {
            return Err(PoolError::NoActiveWindow.into());
        }
        self.wallet
            .ledger
            .balance(asset)
            .checked_add(amount)
            .ok_or(PoolError::Overflow)?;

        let mut events = Vec::new();
        if needs_window {
            if self.windows.active_window().is_some() {
                events.extend(self.close_active_window(facility)?);
            }
            let window = self.windows.open_next(now)?;
            events.push(PoolEvent::WindowOpened {
                pool: self.wallet.address.clone(),
                window: window.number,
                start: window.start,
                end: window.end,
            });
        }

        let window = self.windows.record_contribution(caller, asset, amount, now)?;
        self.wallet.ledger.credit(asset, amount)?;

        events.push(PoolEvent::ContributionMade {
            pool: self.address().clone(),
            member: caller.clone(),
            asset: asset.clone(),
            amount,
            window,
        });
        Ok(events)
    }

    /// Close the active window and move its bound-asset totals into custody
    pub fn complete_current_window(
        &mut self,
        caller: &Address,
        facility: &mut dyn YieldFacility,
    ) -> AppResult<Vec<PoolEvent>> {
        self.ensure_active()?;
        self.ensure_manager(caller)?;
        self.close_active_window(facility)
    }

    fn close_active_window(&mut self, facility: &mut dyn YieldFacility) -> AppResult<Vec<PoolEvent>> {
        let (number, totals) = self.windows.complete_active()?;
        let mut events = vec![PoolEvent::WindowCompleted {
            pool: self.address().clone(),
            window: number,
            totals: totals.clone(),
        }];

        for (asset, amount) in totals {
            if amount == 0 || !self.custody.is_bound(&asset) {
                continue;
            }
            events.push(
                self.custody
                    .supply(&mut self.wallet.ledger, facility, &asset, amount)?,
            );
        }

        info!("Window {} of pool {} completed", number, self.address());
        Ok(events)
    }

    /// Assets that received contributions. Unbound ones are settled straight
    /// from the pool ledger.
    pub fn settleable_assets(&self) -> Vec<AssetId> {
        self.windows.contributed_assets()
    }

    /// Bound assets: receipt balance plus anything still waiting in the
    /// active window. Unbound assets: the ledger balance.
    pub fn claim_of(&self, asset: &AssetId, facility: &dyn YieldFacility) -> u128 {
        if !self.custody.is_bound(asset) {
            return self.wallet.ledger.balance(asset);
        }
        let pending = self
            .windows
            .active_window()
            .map(|w| w.total(asset))
            .unwrap_or(0);
        facility
            .receipt_balance(self.address(), asset)
            .saturating_add(pending)
    }

    /// Unsettled assets with a nonzero claim, bound assets first
    pub fn custody_claims(&self, facility: &dyn YieldFacility) -> Vec<(AssetId, u128)> {
        let mut assets: Vec<AssetId> = self.custody.bound_assets().to_vec();
        for asset in self.settleable_assets() {
            if !assets.contains(&asset) {
                assets.push(asset);
            }
        }

        assets
            .into_iter()
            .filter(|asset| !self.settled_assets.contains(asset))
            .map(|asset| {
                let claim = self.claim_of(&asset, facility);
                (asset, claim)
            })
            .filter(|(_, claim)| *claim > 0)
            .collect()
    }

    pub fn yield_position(&self, asset: &AssetId, facility: &dyn YieldFacility) -> YieldPosition {
        self.custody.position(facility, asset)
    }

    fn member_shares(&self, asset: &AssetId) -> Vec<MemberShare> {
        self.members
            .iter()
            .map(|m| MemberShare {
                member: m.address.clone(),
                payout_address: m.payout_address.clone(),
                contribution: self.windows.member_contribution(&m.address, asset),
            })
            .collect()
    }

    /// Withdraw one asset from custody (or take it from the ledger when it has
    /// no facility binding) and distribute it to members
    pub fn settle_asset(
        &mut self,
        asset: &AssetId,
        now: Timestamp,
        facility: &mut dyn YieldFacility,
    ) -> AppResult<SettlementOutcome> {
        if self.settled_assets.contains(asset) {
            return Err(SettlementError::AlreadySettled {
                pool: self.address().clone(),
                asset: asset.clone(),
            }
            .into());
        }
        self.ensure_active()?;
        if !self.is_lock_elapsed(now) {
            return Err(PoolError::LockPeriodNotElapsed {
                unlocks_at: self.lock_until,
            }
            .into());
        }
        if self.claim_of(asset, &*facility) == 0 {
            return Err(SettlementError::NothingToSettle(asset.clone()).into());
        }

        let mut events = Vec::new();
        if self.windows.active_window().is_some() {
            events.extend(self.close_active_window(facility)?);
        }

        let (principal, total) = if self.custody.is_bound(asset) {
            let principal = self.custody.principal_supplied(asset);
            let (total, withdrawn) = self.custody.withdraw(
                &mut self.wallet.ledger,
                facility,
                asset,
                WithdrawAmount::All,
            )?;
            events.push(withdrawn);
            (principal, total)
        } else {
            let held = self.wallet.ledger.balance(asset);
            (held, held)
        };

        let fee_bps = self.wallet.behavior().fee_bps;
        let fee_recipient = self.wallet.behavior().fee_recipient.clone();
        let amounts = compute_settlement(total, principal, fee_bps);
        let allocation = allocate_payouts(amounts.distributable, &self.member_shares(asset))?;

        self.wallet.ledger.debit(asset, total)?;

        let mut transfers: Vec<Transfer> = allocation
            .payouts
            .iter()
            .filter(|line| line.amount > 0)
            .map(|line| Transfer {
                asset: asset.clone(),
                to: line.payout_address.clone(),
                amount: line.amount,
            })
            .collect();
        if amounts.fee > 0 {
            transfers.push(Transfer {
                asset: asset.clone(),
                to: fee_recipient.clone(),
                amount: amounts.fee,
            });
        }
        if allocation.dust > 0 {
            transfers.push(Transfer {
                asset: asset.clone(),
                to: fee_recipient,
                amount: allocation.dust,
            });
        }

        let pool = self.address().clone();
        events.push(PoolEvent::SettlementProcessed {
            pool: pool.clone(),
            asset: asset.clone(),
            total_amount: amounts.total,
            principal: amounts.principal,
            interest: amounts.interest,
            fee: amounts.fee,
            timestamp: now,
        });
        events.extend(allocation.payouts.iter().map(|line| PoolEvent::MemberPayout {
            pool: pool.clone(),
            asset: asset.clone(),
            member: line.member.clone(),
            amount: line.amount,
            contribution: line.contribution,
            timestamp: now,
        }));

        self.settled_assets.push(asset.clone());
        let pool_completed = self
            .settleable_assets()
            .iter()
            .all(|a| self.settled_assets.contains(a));
        if pool_completed {
            self.status = PoolStatus::Completed;
            events.push(PoolEvent::PoolCompleted {
                pool: pool.clone(),
                timestamp: now,
            });
        }

        info!(
            "Settled {} for pool {}: total {}, interest {}, fee {}, {} payouts",
            asset,
            pool,
            amounts.total,
            amounts.interest,
            amounts.fee,
            allocation.payouts.len()
        );

        Ok(SettlementOutcome {
            asset: asset.clone(),
            amounts,
            allocation,
            transfers,
            events,
            pool_completed,
        })
    }

    /// Owner-only cancellation; refunds every contribution still held by the ledger
    pub fn cancel(&mut self, caller: &Address, now: Timestamp) -> AppResult<(Vec<PoolEvent>, Vec<Transfer>)> {
        self.ensure_active()?;
        if caller != self.owner() {
            return Err(PoolError::NotAuthorized(caller.clone()).into());
        }
        if self
            .custody
            .bound_assets()
            .iter()
            .any(|asset| self.custody.principal_supplied(asset) > 0)
        {
            return Err(PoolError::PrincipalInCustody.into());
        }

        let mut transfers = Vec::new();
        for asset in self.windows.contributed_assets() {
            for member in &self.members {
                let amount = self.windows.member_contribution(&member.address, &asset);
                if amount > 0 {
                    transfers.push(Transfer {
                        asset: asset.clone(),
                        to: member.payout_address.clone(),
                        amount,
                    });
                }
            }
        }
        for transfer in &transfers {
            self.wallet.ledger.debit(&transfer.asset, transfer.amount)?;
        }

        if self.windows.active_window().is_some() {
            self.windows.complete_active()?;
        }
        self.status = PoolStatus::Cancelled;
        info!("Pool {} cancelled, {} refunds", self.address(), transfers.len());

        Ok((
            vec![PoolEvent::PoolCancelled {
                pool: self.address().clone(),
                timestamp: now,
            }],
            transfers,
        ))
    }
}
