//! Event Reconciliation Listener.
//!
//! Projects settlement-related chain logs into the mirror. Each pool gets
//! one subscription task, so its logs are applied in chain order by a
//! single consumer. Every handler is idempotent; replaying a block range
//! any number of times leaves the mirror unchanged after the first pass.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chain::{BlockNumber, ChainLog, EventSource};
use crate::error::AppResult;
use crate::mirror::{
    to_datetime, MirrorStore, PayoutRecord, SettlementRecord, YieldWithdrawalRecord,
};
use crate::pool::events::{EventKind, PoolEvent};
use crate::pool::models::{Address, AssetDecimals, AssetId};

struct Subscription {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct EventListener {
    source: Arc<dyn EventSource>,
    mirror: Arc<dyn MirrorStore>,
    subscriptions: parking_lot::Mutex<HashMap<Address, Subscription>>,
    decimals: AssetDecimals,
}

impl EventListener {
    pub fn new(source: Arc<dyn EventSource>, mirror: Arc<dyn MirrorStore>) -> Self {
        Self {
            source,
            mirror,
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
            decimals: AssetDecimals::new(),
        }
    }

    pub fn with_asset_decimals(mut self, decimals: AssetDecimals) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn is_listening(&self, pool: &Address) -> bool {
        self.subscriptions.lock().contains_key(pool)
    }

    pub fn listening_pools(&self) -> Vec<Address> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Subscribe to a pool's settlement logs. Returns false if already subscribed.
    pub async fn start_listening(self: &Arc<Self>, pool: &Address) -> AppResult<bool> {
        if self.is_listening(pool) {
            return Ok(false);
        }

        let mut receiver = self.source.subscribe().await?;

        // The task may close its own entry, so it is spawned and registered
        // under one lock hold.
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(pool) {
            return Ok(false);
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let listener = Arc::clone(self);
        let address = pool.clone();

        let handle = tokio::spawn(async move {
            let mut last_block: BlockNumber = 0;
            loop {
                let log = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    received = receiver.recv() => received,
                };

                match log {
                    Ok(log) => {
                        if log.address != address || !log.event.is_settlement_kind() {
                            continue;
                        }
                        last_block = log.block_number;
                        if let Err(e) = listener.apply_log(&log).await {
                            error!("❌ Failed to apply {:?} for {}: {}", log.event.kind(), address, e);
                        }
                        if log.event.kind() == EventKind::PoolCompleted {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("⚠️  Listener for {} lagged by {} logs, backfilling", address, missed);
                        if let Err(e) = listener.process_past_events(&address, last_block).await {
                            error!("❌ Backfill for {} failed: {}", address, e);
                        }
                        if !listener.is_listening(&address) {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        listener.subscriptions.lock().remove(&address);
                        warn!("Log feed closed, listener for {} exiting", address);
                        break;
                    }
                }
            }
        });

        subscriptions.insert(pool.clone(), Subscription { shutdown, handle });
        info!("👂 Listening for settlement events of {}", pool);
        Ok(true)
    }

    /// Drop a pool's subscription without waiting for its task; used from
    /// inside the task itself once the pool has completed
    fn close_subscription(&self, pool: &Address) {
        if let Some(subscription) = self.subscriptions.lock().remove(pool) {
            let _ = subscription.shutdown.send(true);
            info!("Pool {} completed, subscription closed", pool);
        }
    }

    pub async fn stop_listening(&self, pool: &Address) -> bool {
        let subscription = self.subscriptions.lock().remove(pool);
        match subscription {
            Some(Subscription { shutdown, handle }) => {
                let _ = shutdown.send(true);
                if let Err(e) = handle.await {
                    error!("Listener task for {} ended abnormally: {:?}", pool, e);
                }
                info!("Stopped listening to {}", pool);
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let pools = self.listening_pools();
        for pool in pools {
            self.stop_listening(&pool).await;
        }
    }

    /// Replay settlement logs of `pool` from `from_block` to head.
    /// Returns the number of logs that changed the mirror.
    #[instrument(skip(self))]
    pub async fn process_past_events(&self, pool: &Address, from_block: BlockNumber) -> AppResult<usize> {
        let head = self.source.head_block().await?;
        if from_block > head {
            return Ok(0);
        }

        let mut logs: Vec<ChainLog> = self
            .source
            .logs(pool, from_block, head)
            .await?
            .into_iter()
            .filter(|log| log.event.is_settlement_kind())
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut applied = 0;
        for log in &logs {
            if self.apply_log(log).await? {
                applied += 1;
            }
        }

        info!(
            "🔁 Replayed {} log(s) for {} from block {} ({} applied)",
            logs.len(),
            pool,
            from_block,
            applied
        );
        Ok(applied)
    }

    pub async fn settlement_history(&self, pool: &Address) -> AppResult<Vec<SettlementRecord>> {
        self.mirror.settlements_for_pool(pool).await
    }

    /// Apply one log to the mirror; false when it was a duplicate or discarded
    pub async fn apply_log(&self, log: &ChainLog) -> AppResult<bool> {
        match &log.event {
            PoolEvent::SettlementProcessed {
                pool,
                asset,
                total_amount,
                principal,
                interest,
                fee,
                timestamp,
            } => {
                if self.mirror.get_pool(pool).await?.is_none() {
                    warn!("Settlement for unknown pool {} skipped", pool);
                    return Ok(false);
                }

                let distributable = total_amount.saturating_sub(*fee);
                let (Some(total), Some(principal), Some(interest), Some(fee), Some(distributable)) = (
                    self.amount(asset, *total_amount, log),
                    self.amount(asset, *principal, log),
                    self.amount(asset, *interest, log),
                    self.amount(asset, *fee, log),
                    self.amount(asset, distributable, log),
                ) else {
                    return Ok(false);
                };

                let record = SettlementRecord {
                    id: Uuid::new_v4(),
                    pool: pool.clone(),
                    asset: asset.clone(),
                    total,
                    principal,
                    interest,
                    fee,
                    distributable,
                    payouts: Vec::new(),
                    tx_hash: log.tx_hash.clone(),
                    block_number: log.block_number as i64,
                    settled_at: to_datetime(*timestamp),
                };

                let outcome = self.mirror.append_settlement(record).await?;
                debug!("Settlement {} for {}: {:?}", log.tx_hash, pool, outcome);
                Ok(outcome.is_inserted())
            }

            PoolEvent::MemberPayout {
                pool,
                asset,
                member,
                amount,
                contribution,
                timestamp,
            } => {
                let Some(settlement) = self.settlement_for_tx(pool, asset, &log.tx_hash).await? else {
                    warn!(
                        "Payout to {} in {} matches no recorded settlement, discarded",
                        member, log.tx_hash
                    );
                    return Ok(false);
                };

                let (Some(amount), Some(contribution)) = (
                    self.amount(asset, *amount, log),
                    self.amount(asset, *contribution, log),
                ) else {
                    return Ok(false);
                };

                let payout = PayoutRecord {
                    member: member.clone(),
                    amount,
                    contribution,
                    paid_at: to_datetime(*timestamp),
                };
                let outcome = self.mirror.append_payout(settlement.id, payout).await?;
                Ok(outcome.is_inserted())
            }

            PoolEvent::PoolCompleted { pool, timestamp } => {
                let marked = self
                    .mirror
                    .mark_pool_inactive(pool, to_datetime(*timestamp))
                    .await;
                self.close_subscription(pool);

                let changed = marked?;
                if changed {
                    info!("🏁 Pool {} marked completed in mirror", pool);
                }
                Ok(changed)
            }

            PoolEvent::WithdrawnFromYield { asset, amount } => {
                let pool = &log.address;
                if self.mirror.get_pool(pool).await?.is_none() {
                    warn!("Yield withdrawal for unknown pool {} skipped", pool);
                    return Ok(false);
                }

                let asset = match asset {
                    Some(asset) => asset.clone(),
                    None => self.withdrawn_asset(pool, &log.tx_hash).await?,
                };
                let Some(amount) = self.amount(&asset, *amount, log) else {
                    return Ok(false);
                };
                let record = YieldWithdrawalRecord {
                    pool: pool.clone(),
                    asset,
                    amount,
                    tx_hash: log.tx_hash.clone(),
                    block_number: log.block_number as i64,
                };
                Ok(self.mirror.record_yield_withdrawal(record).await?.is_inserted())
            }

            other => {
                debug!("Ignoring {:?} log", other.kind());
                Ok(false)
            }
        }
    }

    /// The most recent settlement when it belongs to `tx_hash`, otherwise an
    /// older one from the same transaction (replays after a partial failure)
    async fn settlement_for_tx(
        &self,
        pool: &Address,
        asset: &AssetId,
        tx_hash: &str,
    ) -> AppResult<Option<SettlementRecord>> {
        let Some(latest) = self.mirror.latest_settlement(pool).await? else {
            return Ok(None);
        };
        if latest.tx_hash == tx_hash && &latest.asset == asset {
            return Ok(Some(latest));
        }

        Ok(self
            .mirror
            .settlements_for_pool(pool)
            .await?
            .into_iter()
            .find(|s| s.tx_hash == tx_hash && &s.asset == asset))
    }

    /// Asset of a withdrawal log that did not carry one: taken from the
    /// facility's own withdrawal log in the same transaction, else native
    async fn withdrawn_asset(&self, pool: &Address, tx_hash: &str) -> AppResult<AssetId> {
        let logs = self.source.transaction_logs(tx_hash).await?;
        let asset = logs.into_iter().find_map(|log| match log.event {
            PoolEvent::FacilityWithdrawal { holder, asset, .. } if &holder == pool => Some(asset),
            _ => None,
        });
        Ok(asset.unwrap_or_else(AssetId::native))
    }

    /// Scale base units by the asset's decimals; a value the mirror cannot
    /// hold is logged and the log is dropped
    fn amount(&self, asset: &AssetId, base_units: u128, log: &ChainLog) -> Option<Decimal> {
        match self.decimals.to_decimal(asset, base_units) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    "❌ {:?} in {} carries {} {} that cannot be mirrored: {}",
                    log.event.kind(),
                    log.tx_hash,
                    base_units,
                    asset,
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainGateway, FeeOracle, GasParams, LocalChain};
    use crate::mirror::{MemoryMirrorStore, PoolRecord};
    use crate::pool::account::PoolParams;
    use crate::pool::models::ONE_TOKEN;
    use crate::pool::wallet::WalletBehavior;
    use rust_decimal_macros::dec;
    use tokio::time::{sleep, Duration};

    const DAY: i64 = 86_400;

    struct Fixture {
        chain: Arc<LocalChain>,
        mirror: Arc<MemoryMirrorStore>,
        listener: Arc<EventListener>,
        pool: Address,
        asset: AssetId,
    }

    async fn fixture() -> Fixture {
        fixture_for(AssetId::native()).await
    }

    /// Scenario A pool in `asset`: 2.0 + 3.0 supplied, 0.1 interest, lock elapsed
    async fn fixture_for(asset: AssetId) -> Fixture {
        let chain = Arc::new(LocalChain::new(
            WalletBehavior::new(Address::new("0xtreasury")).with_facility_asset(asset.clone()),
            Address::new("0xoperator"),
            1_700_000_000,
        ));
        let mirror = Arc::new(MemoryMirrorStore::new());
        let owner = Address::new("0xowner");

        let (pool, _) = chain
            .create_pool(PoolParams {
                name: "Scenario A".to_string(),
                owner: owner.clone(),
                window_duration: 7 * DAY,
                min_contribution: ONE_TOKEN / 100,
                max_members: 10,
                lock_period: 30 * DAY,
                extra_assets: Vec::new(),
            })
            .await
            .unwrap();
        mirror
            .upsert_pool(PoolRecord::new(pool.clone(), "Scenario A", owner.clone(), 30 * DAY))
            .await
            .unwrap();

        for (name, amount) in [("0xalice", 2), ("0xbob", 3)] {
            let member = Address::new(name);
            chain.mint(&member, &asset, amount * ONE_TOKEN).await;
            chain
                .add_member(&pool, &owner, member.clone(), member.clone())
                .await
                .unwrap();
            chain
                .contribute(&pool, &member, &asset, amount * ONE_TOKEN)
                .await
                .unwrap();
        }
        chain.complete_window(&pool, &owner).await.unwrap();
        chain
            .accrue_yield(&pool, &asset, ONE_TOKEN / 10)
            .await
            .unwrap();
        chain.advance_time(30 * DAY).await;

        let listener = Arc::new(EventListener::new(chain.clone(), mirror.clone()));
        Fixture {
            chain,
            mirror,
            listener,
            pool,
            asset,
        }
    }

    async fn settle(fx: &Fixture) -> String {
        let fee = fx.chain.fee_quote().await.unwrap();
        let estimate = fx
            .chain
            .estimate_settlement_gas(&fx.pool, &fx.asset)
            .await
            .unwrap();
        fx.chain
            .submit_settlement(&fx.pool, &fx.asset, GasParams::with_margin(estimate, 20, fee))
            .await
            .unwrap()
            .tx_hash
    }

    fn assert_scenario_a(history: &[SettlementRecord]) {
        assert_eq!(history.len(), 1);
        let record = &history[0];
        assert_eq!(record.total, dec!(5.1));
        assert_eq!(record.principal, dec!(5));
        assert_eq!(record.interest, dec!(0.1));
        assert_eq!(record.fee, dec!(0.003));
        assert_eq!(record.distributable, dec!(5.097));
        let amounts: Vec<_> = record.payouts.iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![dec!(2.0388), dec!(3.0582)]);
    }

    #[tokio::test]
    async fn test_live_subscription_mirrors_settlement() {
        let fx = fixture().await;
        assert!(fx.listener.start_listening(&fx.pool).await.unwrap());
        assert!(!fx.listener.start_listening(&fx.pool).await.unwrap());

        let tx_hash = settle(&fx).await;

        for _ in 0..100 {
            if !fx.listener.is_listening(&fx.pool) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.listener.is_listening(&fx.pool));

        let history = fx.listener.settlement_history(&fx.pool).await.unwrap();
        assert_scenario_a(&history);
        assert_eq!(history[0].tx_hash, tx_hash);
        assert!(!fx.mirror.get_pool(&fx.pool).await.unwrap().unwrap().is_active);

        let withdrawals = fx.mirror.yield_withdrawals(&fx.pool).await.unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].amount, dec!(5.1));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let fx = fixture().await;
        settle(&fx).await;

        // settlement, two payouts, pool completed, yield withdrawal
        assert_eq!(fx.listener.process_past_events(&fx.pool, 0).await.unwrap(), 5);
        let first = fx.listener.settlement_history(&fx.pool).await.unwrap();
        assert_scenario_a(&first);

        assert_eq!(fx.listener.process_past_events(&fx.pool, 0).await.unwrap(), 0);
        let second = fx.listener.settlement_history(&fx.pool).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.mirror.yield_withdrawals(&fx.pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_partial_apply_recovers_payouts() {
        let fx = fixture().await;
        settle(&fx).await;

        let head = fx.chain.head_block().await.unwrap();
        let logs = fx.chain.logs(&fx.pool, 0, head).await.unwrap();
        let settlement_log = logs
            .iter()
            .find(|l| l.event.kind() == EventKind::SettlementProcessed)
            .unwrap();
        assert!(fx.listener.apply_log(settlement_log).await.unwrap());

        assert_eq!(fx.listener.process_past_events(&fx.pool, 0).await.unwrap(), 4);
        assert_scenario_a(&fx.listener.settlement_history(&fx.pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_payout_with_unknown_tx_is_discarded() {
        let fx = fixture().await;
        settle(&fx).await;
        fx.listener.process_past_events(&fx.pool, 0).await.unwrap();

        let stray = ChainLog {
            address: fx.pool.clone(),
            block_number: 999,
            log_index: 0,
            tx_hash: "0xdeadbeef".to_string(),
            event: PoolEvent::MemberPayout {
                pool: fx.pool.clone(),
                asset: AssetId::native(),
                member: Address::new("0xmallory"),
                amount: ONE_TOKEN,
                contribution: ONE_TOKEN,
                timestamp: 1_800_000_000,
            },
        };
        assert!(!fx.listener.apply_log(&stray).await.unwrap());

        let history = fx.listener.settlement_history(&fx.pool).await.unwrap();
        assert_eq!(history[0].payouts.len(), 2);
        assert!(!history[0].has_payout_for(&Address::new("0xmallory")));
    }

    #[tokio::test]
    async fn test_settlement_for_unknown_pool_is_skipped() {
        let fx = fixture().await;
        let ghost = Address::new("0xghost");
        let log = ChainLog {
            address: ghost.clone(),
            block_number: 1,
            log_index: 0,
            tx_hash: "0x01".to_string(),
            event: PoolEvent::SettlementProcessed {
                pool: ghost.clone(),
                asset: AssetId::native(),
                total_amount: 10,
                principal: 10,
                interest: 0,
                fee: 0,
                timestamp: 1_800_000_000,
            },
        };
        assert!(!fx.listener.apply_log(&log).await.unwrap());
        assert!(fx.listener.settlement_history(&ghost).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_without_asset_is_disambiguated() {
        let usdc = AssetId::new("0xusdc");
        let fx = fixture_for(usdc.clone()).await;
        let tx_hash = settle(&fx).await;

        let legacy = |tx_hash: &str| ChainLog {
            address: fx.pool.clone(),
            block_number: 1,
            log_index: 0,
            tx_hash: tx_hash.to_string(),
            event: PoolEvent::WithdrawnFromYield {
                asset: None,
                amount: 7,
            },
        };

        assert!(fx.listener.apply_log(&legacy(&tx_hash)).await.unwrap());
        assert!(fx.listener.apply_log(&legacy("0xunknown")).await.unwrap());
        assert!(!fx.listener.apply_log(&legacy("0xunknown")).await.unwrap());

        let withdrawals = fx.mirror.yield_withdrawals(&fx.pool).await.unwrap();
        assert_eq!(withdrawals.len(), 2);
        let asset_of = |hash: &str| {
            withdrawals
                .iter()
                .find(|w| w.tx_hash == hash)
                .map(|w| w.asset.clone())
                .unwrap()
        };
        // the facility log in the settlement tx names usdc; a bare tx falls back to native
        assert_eq!(asset_of(&tx_hash), usdc);
        assert_eq!(asset_of("0xunknown"), AssetId::native());
    }

    #[tokio::test]
    async fn test_backfilled_completion_closes_subscription() {
        let fx = fixture().await;
        settle(&fx).await;

        // the live task subscribed after the settlement and never sees it
        assert!(fx.listener.start_listening(&fx.pool).await.unwrap());
        assert_eq!(fx.listener.process_past_events(&fx.pool, 0).await.unwrap(), 5);

        assert!(!fx.listener.is_listening(&fx.pool));
        assert!(fx.listener.listening_pools().is_empty());
        assert!(!fx.mirror.get_pool(&fx.pool).await.unwrap().unwrap().is_active);
    }

    fn settlement_log(pool: &Address, asset: AssetId, total: u128, fee: u128) -> ChainLog {
        ChainLog {
            address: pool.clone(),
            block_number: 1,
            log_index: 0,
            tx_hash: "0x5e771e".to_string(),
            event: PoolEvent::SettlementProcessed {
                pool: pool.clone(),
                asset,
                total_amount: total,
                principal: total,
                interest: 0,
                fee,
                timestamp: 1_800_000_000,
            },
        }
    }

    #[tokio::test]
    async fn test_amounts_use_asset_decimals() {
        let fx = fixture().await;
        let usdc = AssetId::new("0xusdc");
        let listener = EventListener::new(fx.chain.clone(), fx.mirror.clone())
            .with_asset_decimals(AssetDecimals::new().with(usdc.clone(), 6));

        let mut log = settlement_log(&fx.pool, usdc.clone(), 5_100_000, 3_000);
        if let PoolEvent::SettlementProcessed { principal, interest, .. } = &mut log.event {
            *principal = 5_000_000;
            *interest = 100_000;
        }
        assert!(listener.apply_log(&log).await.unwrap());

        let record = &listener.settlement_history(&fx.pool).await.unwrap()[0];
        assert_eq!(record.asset, usdc);
        assert_eq!(record.total, dec!(5.1));
        assert_eq!(record.principal, dec!(5));
        assert_eq!(record.interest, dec!(0.1));
        assert_eq!(record.fee, dec!(0.003));
        assert_eq!(record.distributable, dec!(5.097));
    }

    #[tokio::test]
    async fn test_unrepresentable_amount_is_not_mirrored() {
        let fx = fixture().await;
        let log = settlement_log(&fx.pool, AssetId::native(), u128::MAX, 0);

        assert!(!fx.listener.apply_log(&log).await.unwrap());
        assert!(fx.listener.settlement_history(&fx.pool).await.unwrap().is_empty());
    }

    /// Feed whose sender is already gone
    struct ClosedFeed;

    #[async_trait::async_trait]
    impl EventSource for ClosedFeed {
        async fn subscribe(&self) -> AppResult<tokio::sync::broadcast::Receiver<ChainLog>> {
            let (_, receiver) = tokio::sync::broadcast::channel(1);
            Ok(receiver)
        }

        async fn logs(&self, _: &Address, _: BlockNumber, _: BlockNumber) -> AppResult<Vec<ChainLog>> {
            Ok(Vec::new())
        }

        async fn transaction_logs(&self, _: &str) -> AppResult<Vec<ChainLog>> {
            Ok(Vec::new())
        }

        async fn head_block(&self) -> AppResult<BlockNumber> {
            Ok(0)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_exiting_at_once_leaves_no_stale_entry() {
        let listener = Arc::new(EventListener::new(
            Arc::new(ClosedFeed),
            Arc::new(MemoryMirrorStore::new()),
        ));
        let pool = Address::new("0xpool");

        for _ in 0..20 {
            assert!(listener.start_listening(&pool).await.unwrap());
            for _ in 0..100 {
                if !listener.is_listening(&pool) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            assert!(!listener.is_listening(&pool));
        }
    }

    #[tokio::test]
    async fn test_stop_all_closes_subscriptions() {
        let fx = fixture().await;
        fx.listener.start_listening(&fx.pool).await.unwrap();
        assert_eq!(fx.listener.listening_pools(), vec![fx.pool.clone()]);

        fx.listener.stop_all().await;
        assert!(fx.listener.listening_pools().is_empty());
        assert!(!fx.listener.stop_listening(&fx.pool).await);
    }
}
