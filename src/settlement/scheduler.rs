// Eligibility Scheduler - drives settlement of pools whose lock period elapsed
//
// Strategy:
// - Poll every tracked pool on a fixed interval (default 5 minutes)
// - Submit one settlement transaction per claimed asset
// - Transient failures stay unhandled and are retried next tick
// - Business reverts ("already settled") count as done
// - Completed pools drop out of the registry

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{ChainGateway, FeeOracle, GasParams, TxReceipt};
use crate::error::AppResult;
use crate::mirror::MirrorStore;
use crate::pool::models::{Address, AssetId, PoolStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_GAS_MARGIN_PERCENT: u64 = 20;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub gas_margin_percent: u64,
    pub operator_address: Address,
}

impl SchedulerConfig {
    pub fn new(operator_address: Address) -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            gas_margin_percent: DEFAULT_GAS_MARGIN_PERCENT,
            operator_address,
        }
    }
}

#[derive(Debug, Clone)]
struct MonitorEntry {
    lock_period: i64,
    name: String,
    processed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedPoolView {
    pub address: Address,
    pub cached_lock_period: i64,
    pub name: String,
    pub processed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub tracked_pool_count: usize,
    pub processed_count: usize,
    pub operator_address: Address,
}

/// Reply to a manual trigger; business conditions are reported, not raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    pub success: bool,
    pub message: String,
    pub tx_hashes: Vec<String>,
}

impl TriggerOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            tx_hashes: Vec::new(),
        }
    }
}

/// What one pass over one pool did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub eligible: bool,
    pub submitted: Vec<(AssetId, String)>,
    /// Business reverts, treated as already done
    pub reverted: Vec<(AssetId, String)>,
    /// Transient failures, retried next tick
    pub failed: Vec<(AssetId, String)>,
    pub retired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub skipped: bool,
    pub pools_checked: usize,
    pub settlements_submitted: usize,
    pub pool_errors: usize,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Long-lived service polling tracked pools for settlement eligibility
pub struct EligibilityScheduler {
    config: SchedulerConfig,
    gateway: Arc<dyn ChainGateway>,
    fees: Arc<dyn FeeOracle>,
    mirror: Arc<dyn MirrorStore>,
    tracked: RwLock<BTreeMap<Address, MonitorEntry>>,
    handled: RwLock<HashSet<(Address, AssetId)>>,
    tick_lock: Mutex<()>,
    running: parking_lot::Mutex<Option<RunningLoop>>,
}

impl EligibilityScheduler {
    pub fn new(
        config: SchedulerConfig,
        gateway: Arc<dyn ChainGateway>,
        fees: Arc<dyn FeeOracle>,
        mirror: Arc<dyn MirrorStore>,
    ) -> Self {
        Self {
            config,
            gateway,
            fees,
            mirror,
            tracked: RwLock::new(BTreeMap::new()),
            handled: RwLock::new(HashSet::new()),
            tick_lock: Mutex::new(()),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Start the polling loop (no-op if already running)
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Scheduler already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let period = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.run_tick().await {
                            error!("❌ Scheduler tick failed: {:?}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Eligibility scheduler loop exited");
        });

        info!(
            "⏰ Eligibility scheduler started (every {}s, operator {})",
            period.as_secs(),
            self.config.operator_address
        );
        *running = Some(RunningLoop { shutdown, handle });
    }

    /// Halt future ticks; a tick already in flight runs to completion
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(RunningLoop { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {:?}", e);
            }
            info!("Eligibility scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start tracking a pool; caches its lock period and display name
    #[instrument(skip(self))]
    pub async fn register_pool(&self, address: &Address) -> AppResult<TrackedPoolView> {
        let snapshot = self.gateway.pool_snapshot(address).await?;
        let name = match self.mirror.get_pool(address).await? {
            Some(record) => record.name,
            None => snapshot.name.clone(),
        };

        let entry = MonitorEntry {
            lock_period: snapshot.lock_period,
            name,
            processed: false,
        };
        let view = Self::view(address, &entry);
        self.tracked.write().await.insert(address.clone(), entry);

        info!("👀 Monitoring pool {} ({})", address, view.name);
        Ok(view)
    }

    pub async fn unregister_pool(&self, address: &Address) -> bool {
        let removed = self.tracked.write().await.remove(address).is_some();
        if removed {
            info!("Stopped monitoring pool {}", address);
        }
        removed
    }

    /// Rebuild the registry from active pool records after a restart
    pub async fn restore_from_mirror(&self) -> AppResult<usize> {
        let pools = self.mirror.list_active_pools().await?;
        let mut restored = 0;
        for pool in pools {
            match self.register_pool(&pool.address).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("Could not restore monitoring for {}: {}", pool.address, e),
            }
        }
        info!("🔁 Restored {} monitored pool(s) from mirror", restored);
        Ok(restored)
    }

    /// One pass over every tracked pool. Skipped if a pass is already running.
    pub async fn run_tick(&self) -> AppResult<TickReport> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("Previous tick still running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };

        let pools: Vec<Address> = self.tracked.read().await.keys().cloned().collect();
        let mut report = TickReport {
            pools_checked: pools.len(),
            ..TickReport::default()
        };

        for pool in pools {
            match self.process_pool(&pool).await {
                Ok(pool_report) => {
                    report.settlements_submitted += pool_report.submitted.len();
                    if !pool_report.failed.is_empty() {
                        report.pool_errors += 1;
                    }
                }
                Err(e) => {
                    report.pool_errors += 1;
                    error!("❌ Eligibility check failed for {}: {}", pool, e);
                }
            }
        }

        if report.settlements_submitted > 0 || report.pool_errors > 0 {
            info!(
                "✓ Tick done: {} pool(s), {} settlement(s), {} error(s)",
                report.pools_checked, report.settlements_submitted, report.pool_errors
            );
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn process_pool(&self, pool: &Address) -> AppResult<PoolReport> {
        let eligibility = self.gateway.check_eligibility(pool).await?;
        let mut report = PoolReport {
            eligible: eligibility.is_eligible(),
            ..PoolReport::default()
        };

        if eligibility.status != PoolStatus::Active {
            self.retire(pool).await;
            report.retired = true;
            return Ok(report);
        }
        if !eligibility.lock_elapsed {
            return Ok(report);
        }
        if eligibility.claims.is_empty() {
            debug!("Pool {} eligible but holds no custody claim", pool);
            return Ok(report);
        }

        for (asset, claim) in eligibility.claims {
            let key = (pool.clone(), asset.clone());
            if self.handled.read().await.contains(&key) {
                continue;
            }

            match self.submit(pool, &asset).await {
                Ok(receipt) => {
                    info!(
                        "💸 Settled {} ({} units) for {} in {}",
                        asset, claim, pool, receipt.tx_hash
                    );
                    self.mark_handled(key).await;
                    report.submitted.push((asset, receipt.tx_hash));
                }
                Err(e) if e.is_business_rule() => {
                    info!("Settlement of {} for {} is a no-op: {}", asset, pool, e);
                    self.mark_handled(key).await;
                    report.reverted.push((asset, e.to_string()));
                }
                Err(e) => {
                    warn!("⚠️  Settlement of {} for {} failed, will retry: {}", asset, pool, e);
                    report.failed.push((asset, e.to_string()));
                }
            }
        }

        if !report.submitted.is_empty() || !report.reverted.is_empty() {
            if let Some(entry) = self.tracked.write().await.get_mut(pool) {
                entry.processed = true;
            }
            let snapshot = self.gateway.pool_snapshot(pool).await?;
            if snapshot.status != PoolStatus::Active {
                self.retire(pool).await;
                report.retired = true;
            }
        }

        Ok(report)
    }

    /// Fresh fee quote and gas estimate for every submission
    async fn submit(&self, pool: &Address, asset: &AssetId) -> AppResult<TxReceipt> {
        let fee = self.fees.fee_quote().await?;
        let estimate = self.gateway.estimate_settlement_gas(pool, asset).await?;
        let gas = GasParams::with_margin(estimate, self.config.gas_margin_percent, fee);
        self.gateway.submit_settlement(pool, asset, gas).await
    }

    async fn mark_handled(&self, key: (Address, AssetId)) {
        self.handled.write().await.insert(key);
    }

    /// Drop a finished pool and forget its handled assets
    async fn retire(&self, pool: &Address) {
        self.tracked.write().await.remove(pool);
        self.handled.write().await.retain(|(p, _)| p != pool);
        info!("🏁 Pool {} finished, monitoring removed", pool);
    }

    /// Settle one pool now, bypassing the tick cadence
    #[instrument(skip(self))]
    pub async fn trigger_manual(&self, pool: &Address) -> AppResult<TriggerOutcome> {
        if !self.tracked.read().await.contains_key(pool) {
            return Ok(TriggerOutcome::rejected("Pool is not monitored"));
        }

        let _guard = self.tick_lock.lock().await;
        let report = self.process_pool(pool).await?;

        if report.retired && report.submitted.is_empty() {
            return Ok(TriggerOutcome::rejected("Pool is no longer active"));
        }
        if !report.eligible && report.submitted.is_empty() {
            return Ok(TriggerOutcome::rejected(
                "Pool is not eligible for settlement yet (lock period has not elapsed)",
            ));
        }
        if let Some((asset, reason)) = report.failed.first() {
            return Ok(TriggerOutcome {
                success: false,
                message: format!("Settlement of {} failed: {}", asset, reason),
                tx_hashes: report.submitted.into_iter().map(|(_, tx)| tx).collect(),
            });
        }
        if report.submitted.is_empty() {
            let message = match report.reverted.first() {
                Some((asset, reason)) => format!("Nothing submitted for {}: {}", asset, reason),
                None => "Pool is eligible but holds nothing to settle".to_string(),
            };
            return Ok(TriggerOutcome::rejected(message));
        }

        Ok(TriggerOutcome {
            success: true,
            message: format!("Submitted {} settlement(s)", report.submitted.len()),
            tx_hashes: report.submitted.into_iter().map(|(_, tx)| tx).collect(),
        })
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.is_running(),
            tracked_pool_count: self.tracked.read().await.len(),
            processed_count: self.handled.read().await.len(),
            operator_address: self.config.operator_address.clone(),
        }
    }

    pub async fn tracked_pools(&self) -> Vec<TrackedPoolView> {
        self.tracked
            .read()
            .await
            .iter()
            .map(|(address, entry)| Self::view(address, entry))
            .collect()
    }

    fn view(address: &Address, entry: &MonitorEntry) -> TrackedPoolView {
        TrackedPoolView {
            address: address.clone(),
            cached_lock_period: entry.lock_period,
            name: entry.name.clone(),
            processed: entry.processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{EventSource, LocalChain};
    use crate::mirror::{MemoryMirrorStore, PoolRecord};
    use crate::pool::account::PoolParams;
    use crate::pool::events::EventKind;
    use crate::pool::models::ONE_TOKEN;
    use crate::pool::wallet::WalletBehavior;

    const DAY: i64 = 86_400;

    fn usdc() -> AssetId {
        AssetId::new("0xusdc")
    }

    struct Fixture {
        chain: Arc<LocalChain>,
        mirror: Arc<MemoryMirrorStore>,
        owner: Address,
    }

    impl Fixture {
        fn new() -> Self {
            let behavior = WalletBehavior::new(Address::new("0xtreasury"))
                .with_facility_asset(AssetId::native())
                .with_facility_asset(usdc());
            Self {
                chain: Arc::new(LocalChain::new(behavior, Address::new("0xoperator"), 1_700_000_000)),
                mirror: Arc::new(MemoryMirrorStore::new()),
                owner: Address::new("0xowner"),
            }
        }

        fn scheduler(&self) -> Arc<EligibilityScheduler> {
            let mut config = SchedulerConfig::new(Address::new("0xoperator"));
            config.poll_interval = Duration::from_millis(10);
            Arc::new(EligibilityScheduler::new(
                config,
                self.chain.clone(),
                self.chain.clone(),
                self.mirror.clone(),
            ))
        }

        /// Pool with members who contributed `amounts` of each asset in one window
        async fn pool(&self, name: &str, amounts: &[(AssetId, u128)]) -> Address {
            let (pool, _) = self
                .chain
                .create_pool(PoolParams {
                    name: name.to_string(),
                    owner: self.owner.clone(),
                    window_duration: 7 * DAY,
                    min_contribution: 1,
                    max_members: 10,
                    lock_period: 30 * DAY,
                    extra_assets: Vec::new(),
                })
                .await
                .unwrap();
            self.mirror
                .upsert_pool(PoolRecord::new(pool.clone(), name, self.owner.clone(), 30 * DAY))
                .await
                .unwrap();

            let member = Address::new("0xalice");
            self.chain
                .add_member(&pool, &self.owner, member.clone(), member.clone())
                .await
                .unwrap();
            for (asset, amount) in amounts {
                self.chain.mint(&member, asset, *amount).await;
                self.chain
                    .contribute(&pool, &member, asset, *amount)
                    .await
                    .unwrap();
            }
            if !amounts.is_empty() {
                self.chain.complete_window(&pool, &self.owner).await.unwrap();
            }
            pool
        }

        async fn settlement_count(&self, pool: &Address, asset: &AssetId) -> usize {
            let head = self.chain.head_block().await.unwrap();
            self.chain
                .logs(pool, 0, head)
                .await
                .unwrap()
                .iter()
                .filter(|log| match &log.event {
                    crate::pool::events::PoolEvent::SettlementProcessed { asset: a, .. } => a == asset,
                    _ => false,
                })
                .count()
        }
    }

    #[tokio::test]
    async fn test_tick_waits_for_lock_then_settles_once() {
        let fx = Fixture::new();
        let pool = fx.pool("Rent", &[(AssetId::native(), 5 * ONE_TOKEN)]).await;
        let scheduler = fx.scheduler();

        let view = scheduler.register_pool(&pool).await.unwrap();
        assert_eq!(view.cached_lock_period, 30 * DAY);
        assert_eq!(view.name, "Rent");

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.settlements_submitted, 0);
        assert_eq!(scheduler.status().await.tracked_pool_count, 1);

        fx.chain.advance_time(30 * DAY).await;
        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.settlements_submitted, 1);
        assert_eq!(fx.settlement_count(&pool, &AssetId::native()).await, 1);

        let status = scheduler.status().await;
        assert_eq!(status.tracked_pool_count, 0);
        assert_eq!(status.processed_count, 0);

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.pools_checked, 0);
        assert_eq!(fx.settlement_count(&pool, &AssetId::native()).await, 1);
    }

    #[tokio::test]
    async fn test_eligible_pool_without_claim_submits_nothing() {
        let fx = Fixture::new();
        let pool = fx.pool("Empty", &[]).await;
        let scheduler = fx.scheduler();
        scheduler.register_pool(&pool).await.unwrap();
        fx.chain.advance_time(31 * DAY).await;

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.settlements_submitted, 0);
        assert_eq!(report.pool_errors, 0);
        assert_eq!(fx.settlement_count(&pool, &AssetId::native()).await, 0);
        assert_eq!(scheduler.tracked_pools().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_next_tick() {
        let fx = Fixture::new();
        let pool = fx.pool("Retry", &[(AssetId::native(), 100)]).await;
        let scheduler = fx.scheduler();
        scheduler.register_pool(&pool).await.unwrap();
        fx.chain.advance_time(30 * DAY).await;

        fx.chain.fail_next_submissions(1).await;
        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.settlements_submitted, 0);
        assert_eq!(report.pool_errors, 1);
        assert_eq!(scheduler.tracked_pools().await.len(), 1);

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.settlements_submitted, 1);
        assert_eq!(fx.settlement_count(&pool, &AssetId::native()).await, 1);
    }

    #[tokio::test]
    async fn test_one_failing_pool_does_not_block_others() {
        let fx = Fixture::new();
        let healthy = fx.pool("Healthy", &[(AssetId::native(), 100)]).await;
        let scheduler = fx.scheduler();
        scheduler.register_pool(&healthy).await.unwrap();

        let ghost = Address::new("0xghost");
        assert!(scheduler.register_pool(&ghost).await.is_err());
        scheduler.tracked.write().await.insert(
            ghost.clone(),
            MonitorEntry {
                lock_period: 0,
                name: "ghost".to_string(),
                processed: false,
            },
        );

        fx.chain.advance_time(30 * DAY).await;
        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.pools_checked, 2);
        assert_eq!(report.pool_errors, 1);
        assert_eq!(report.settlements_submitted, 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_outcomes() {
        let fx = Fixture::new();
        let pool = fx.pool("Manual", &[(AssetId::native(), 100)]).await;
        let scheduler = fx.scheduler();

        let outcome = scheduler.trigger_manual(&pool).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Pool is not monitored");

        scheduler.register_pool(&pool).await.unwrap();
        let outcome = scheduler.trigger_manual(&pool).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("Pool is not eligible"));

        fx.chain.advance_time(30 * DAY).await;
        let outcome = scheduler.trigger_manual(&pool).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tx_hashes.len(), 1);
        assert_eq!(scheduler.status().await.tracked_pool_count, 0);
    }

    #[tokio::test]
    async fn test_restart_resumes_without_resettling() {
        let fx = Fixture::new();
        let pool = fx
            .pool("Two assets", &[(AssetId::native(), 100), (usdc(), 200)])
            .await;
        fx.chain.advance_time(30 * DAY).await;

        // a previous process settled native, then went down
        let fee = fx.chain.fee_quote().await.unwrap();
        fx.chain
            .submit_settlement(&pool, &AssetId::native(), GasParams::with_margin(1_000_000, 0, fee))
            .await
            .unwrap();

        let scheduler = fx.scheduler();
        assert!(scheduler.tracked_pools().await.is_empty());
        assert_eq!(scheduler.restore_from_mirror().await.unwrap(), 1);

        let report = scheduler.run_tick().await.unwrap();
        assert_eq!(report.settlements_submitted, 1);
        assert_eq!(fx.settlement_count(&pool, &AssetId::native()).await, 1);
        assert_eq!(fx.settlement_count(&pool, &usdc()).await, 1);
        assert_eq!(
            fx.chain.pool(&pool).await.unwrap().status(),
            PoolStatus::Completed
        );
        assert!(scheduler.tracked_pools().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let fx = Fixture::new();
        let pool = fx.pool("Loop", &[(AssetId::native(), 100)]).await;
        fx.chain.advance_time(30 * DAY).await;

        let scheduler = fx.scheduler();
        scheduler.register_pool(&pool).await.unwrap();
        scheduler.start();
        scheduler.start();
        assert!(scheduler.status().await.is_running);

        for _ in 0..100 {
            if scheduler.tracked_pools().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scheduler.tracked_pools().await.is_empty());

        scheduler.stop().await;
        assert!(!scheduler.status().await.is_running);
        assert_eq!(fx.settlement_count(&pool, &AssetId::native()).await, 1);

        let logs = fx.chain.logs(&pool, 0, fx.chain.head_block().await.unwrap()).await.unwrap();
        assert!(logs.iter().any(|l| l.event.kind() == EventKind::PoolCompleted));
    }
}
