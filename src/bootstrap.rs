use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{error, info, warn};

use crate::{
    chain::{ChainGateway, FeeOracle, LocalChain, RpcFeeOracle},
    config::Config,
    error::AppResult,
    mirror::{MemoryMirrorStore, MirrorStore, PgMirrorStore, PoolRecord},
    pool::{
        account::PoolParams,
        models::{Address, AssetId},
        wallet::WalletBehavior,
    },
    settlement::{EligibilityScheduler, EventListener, SchedulerConfig},
};

/// Long-lived services shared by the binary and integration callers
pub struct AppServices {
    pub config: Config,
    pub chain: Arc<LocalChain>,
    pub mirror: Arc<dyn MirrorStore>,
    pub scheduler: Arc<EligibilityScheduler>,
    pub listener: Arc<EventListener>,
}

pub async fn initialize_services(config: Config) -> AppResult<AppServices> {
    info!("Initializing settlement services ...");

    let mirror: Arc<dyn MirrorStore> = match &config.database_url {
        Some(url) => {
            let pool = initialize_database(url).await?;
            Arc::new(PgMirrorStore::new(pool))
        }
        None => {
            warn!("⚠️  DATABASE_URL not set - mirror is kept in memory only");
            Arc::new(MemoryMirrorStore::new())
        }
    };

    // Ledger host
    let behavior = WalletBehavior::new(config.fee_recipient.clone())
        .with_facility_asset(AssetId::native());
    let chain = Arc::new(LocalChain::new(
        behavior,
        config.operator_address.clone(),
        Utc::now().timestamp(),
    ));
    info!("✅ Ledger host ready (operator {})", config.operator_address);

    let fees: Arc<dyn FeeOracle> = match (&config.chain_rpc_url, config.is_local()) {
        (Some(url), false) => {
            info!("✅ RPC fee oracle initialized for network: {}", config.network);
            Arc::new(RpcFeeOracle::new(url.clone()))
        }
        _ => {
            info!("✅ Using local fee market");
            chain.clone()
        }
    };

    let mut scheduler_config = SchedulerConfig::new(config.operator_address.clone());
    scheduler_config.poll_interval = config.poll_interval;
    scheduler_config.gas_margin_percent = config.gas_margin_percent;

    let scheduler = Arc::new(EligibilityScheduler::new(
        scheduler_config,
        chain.clone(),
        fees,
        mirror.clone(),
    ));
    let listener = Arc::new(
        EventListener::new(chain.clone(), mirror.clone())
            .with_asset_decimals(config.asset_decimals.clone()),
    );

    info!("✓ Settlement services initialized");
    Ok(AppServices {
        config,
        chain,
        mirror,
        scheduler,
        listener,
    })
}

impl AppServices {
    /// Resume monitoring and listening for every active pool, then start polling
    pub async fn start(&self) -> AppResult<()> {
        let restored = self.scheduler.restore_from_mirror().await?;

        for pool in self.mirror.list_active_pools().await? {
            if let Err(e) = self.listener.start_listening(&pool.address).await {
                error!("❌ Could not subscribe to {}: {}", pool.address, e);
                continue;
            }
            match self
                .listener
                .process_past_events(&pool.address, self.config.backfill_from_block)
                .await
            {
                Ok(applied) if applied > 0 => info!("Backfilled {} log(s) for {}", applied, pool.address),
                Ok(_) => {}
                Err(e) => error!("❌ Backfill for {} failed: {}", pool.address, e),
            }
        }

        self.scheduler.start();
        info!("🚀 Settlement services running ({} pool(s) monitored)", restored);
        Ok(())
    }

    /// Mirror, monitor and subscribe to a pool that already exists on the ledger
    pub async fn track_pool(&self, address: &Address) -> AppResult<()> {
        if self.mirror.get_pool(address).await?.is_none() {
            let snapshot = self.chain.pool_snapshot(address).await?;
            self.mirror
                .upsert_pool(PoolRecord::new(
                    address.clone(),
                    snapshot.name,
                    snapshot.owner,
                    snapshot.lock_period,
                ))
                .await?;
        }

        self.scheduler.register_pool(address).await?;
        self.listener.start_listening(address).await?;
        Ok(())
    }

    /// Deploy a pool on the ledger host and start tracking it
    pub async fn create_pool(&self, params: PoolParams) -> AppResult<Address> {
        let (address, receipt) = self.chain.create_pool(params).await?;
        info!("🆕 Pool {} created in {}", address, receipt.tx_hash);
        self.track_pool(&address).await?;
        Ok(address)
    }

    pub async fn shutdown(&self) {
        info!("Shutting down settlement services ...");
        self.scheduler.stop().await;
        self.listener.stop_all().await;
        info!("✓ Shutdown complete");
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
