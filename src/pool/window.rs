use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::PoolError;
use crate::pool::models::{Address, AssetId, Timestamp};

/// Single contribution entry in a window's ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub member: Address,
    pub asset: AssetId,
    pub amount: u128,
    pub timestamp: Timestamp,
}

/// Bounded interval during which contributions accumulate
#[derive(Debug, Clone, Serialize)]
pub struct PaymentWindow {
    pub number: u32,
    pub start: Timestamp,
    pub end: Timestamp,
    pub active: bool,
    pub completed: bool,
    contributions: Vec<Contribution>,
    member_totals: HashMap<(Address, AssetId), u128>,
    totals: BTreeMap<AssetId, u128>,
}

impl PaymentWindow {
    fn open(number: u32, start: Timestamp, duration: i64) -> Self {
        Self {
            number,
            start,
            end: start.saturating_add(duration),
            active: true,
            completed: false,
            contributions: Vec::new(),
            member_totals: HashMap::new(),
            totals: BTreeMap::new(),
        }
    }

    pub fn has_expired(&self, now: Timestamp) -> bool {
        now >= self.end
    }

    pub fn contributions(&self) -> &[Contribution] {
        &self.contributions
    }

    pub fn total(&self, asset: &AssetId) -> u128 {
        self.totals.get(asset).copied().unwrap_or(0)
    }

    /// Aggregate totals ordered by asset id
    pub fn totals(&self) -> Vec<(AssetId, u128)> {
        self.totals
            .iter()
            .map(|(asset, amount)| (asset.clone(), *amount))
            .collect()
    }

    pub fn member_total(&self, member: &Address, asset: &AssetId) -> u128 {
        self.member_totals
            .get(&(member.clone(), asset.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn record(
        &mut self,
        member: &Address,
        asset: &AssetId,
        amount: u128,
        now: Timestamp,
    ) -> Result<(), PoolError> {
        if self.completed || !self.active {
            return Err(PoolError::NoActiveWindow);
        }

        let total = self
            .total(asset)
            .checked_add(amount)
            .ok_or(PoolError::Overflow)?;
        let member_total = self
            .member_total(member, asset)
            .checked_add(amount)
            .ok_or(PoolError::Overflow)?;

        self.totals.insert(asset.clone(), total);
        self.member_totals
            .insert((member.clone(), asset.clone()), member_total);
        self.contributions.push(Contribution {
            member: member.clone(),
            asset: asset.clone(),
            amount,
            timestamp: now,
        });
        Ok(())
    }
}

/// Opens, completes and queries a pool's payment windows
#[derive(Debug, Clone)]
pub struct WindowManager {
    duration: i64,
    windows: Vec<PaymentWindow>,
    paused: bool,
}

impl WindowManager {
    pub fn new(duration: i64) -> Self {
        Self {
            duration,
            windows: Vec::new(),
            paused: false,
        }
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Number of the most recently opened window (0 before the first)
    pub fn current_window_number(&self) -> u32 {
        self.windows.len() as u32
    }

    pub fn windows(&self) -> &[PaymentWindow] {
        &self.windows
    }

    pub fn window(&self, number: u32) -> Option<&PaymentWindow> {
        number
            .checked_sub(1)
            .and_then(|index| self.windows.get(index as usize))
    }

    pub fn active_window(&self) -> Option<&PaymentWindow> {
        self.windows.last().filter(|w| w.active && !w.completed)
    }

    /// Open the next window starting at `now`
    pub fn open_next(&mut self, now: Timestamp) -> Result<&PaymentWindow, PoolError> {
        if self.paused || self.active_window().is_some() {
            return Err(PoolError::NoActiveWindow);
        }
        let number = self.current_window_number() + 1;
        self.windows
            .push(PaymentWindow::open(number, now, self.duration));
        Ok(&self.windows[self.windows.len() - 1])
    }

    /// Close the active window; returns its number and per-asset totals
    pub fn complete_active(&mut self) -> Result<(u32, Vec<(AssetId, u128)>), PoolError> {
        let window = self
            .windows
            .last_mut()
            .filter(|w| w.active && !w.completed)
            .ok_or(PoolError::NoActiveWindow)?;
        window.active = false;
        window.completed = true;
        Ok((window.number, window.totals()))
    }

    pub fn record_contribution(
        &mut self,
        member: &Address,
        asset: &AssetId,
        amount: u128,
        now: Timestamp,
    ) -> Result<u32, PoolError> {
        let window = self.windows.last_mut().ok_or(PoolError::NoActiveWindow)?;
        window.record(member, asset, amount, now)?;
        Ok(window.number)
    }

    /// A member's contribution of `asset` across every window
    pub fn member_contribution(&self, member: &Address, asset: &AssetId) -> u128 {
        self.windows
            .iter()
            .map(|w| w.member_total(member, asset))
            .fold(0u128, u128::saturating_add)
    }

    /// All contributions of `asset` across every window
    pub fn total_contributions(&self, asset: &AssetId) -> u128 {
        self.windows
            .iter()
            .map(|w| w.total(asset))
            .fold(0u128, u128::saturating_add)
    }

    pub fn completed_total(&self, asset: &AssetId) -> u128 {
        self.windows
            .iter()
            .filter(|w| w.completed)
            .map(|w| w.total(asset))
            .fold(0u128, u128::saturating_add)
    }

    /// Every asset that has received at least one contribution, ordered by id
    pub fn contributed_assets(&self) -> Vec<AssetId> {
        let mut assets: Vec<AssetId> = self
            .windows
            .iter()
            .flat_map(|w| w.totals.keys().cloned())
            .collect();
        assets.sort();
        assets.dedup();
        assets
    }
}
