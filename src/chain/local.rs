//! In-process ledger host.
//!
//! Holds every pool account, the lending facility and external account
//! balances behind one mutex, so on-chain transitions are serialised. Each
//! transaction runs against scratch copies of the pool and facility and is
//! committed only if it succeeds, then sealed into its own block. Logs are
//! kept for range queries and fanned out on a broadcast feed.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::chain::facility::LendingFacility;
use crate::chain::{
    BlockNumber, ChainGateway, ChainLog, Eligibility, EventSource, FeeOracle, FeeQuote, GasParams,
    PoolSnapshot, TxReceipt,
};
use crate::error::{AppError, AppResult, ChainError, PoolError};
use crate::pool::account::{PoolAccount, PoolParams};
use crate::pool::events::PoolEvent;
use crate::pool::models::{Address, AssetId, Timestamp, Transfer, WithdrawAmount};
use crate::pool::wallet::{Wallet, WalletBehavior, WalletFactory};

const FEED_CAPACITY: usize = 1024;
const BASE_SETTLEMENT_GAS: u64 = 150_000;
const GAS_PER_PAYOUT: u64 = 30_000;
const DEFAULT_BASE_FEE: u128 = 1_000_000_000;
const PRIORITY_FEE: u128 = 100_000_000;

/// Address the lending facility emits its logs from
pub fn facility_address() -> Address {
    Address::new("0x000000000000000000000000000000000000fac1")
}

type TxOutput<T> = (T, Vec<PoolEvent>, Vec<Transfer>);

struct ChainState {
    factory: WalletFactory,
    pools: HashMap<Address, PoolAccount>,
    wallets: HashMap<Address, Wallet>,
    facility: LendingFacility,
    balances: HashMap<(Address, AssetId), u128>,
    block_number: BlockNumber,
    now: Timestamp,
    logs: Vec<ChainLog>,
    base_fee: u128,
    failing_submissions: u32,
}

impl ChainState {
    fn pool(&self, address: &Address) -> AppResult<&PoolAccount> {
        self.pools
            .get(address)
            .ok_or_else(|| ChainError::UnknownPool(address.clone()).into())
    }

    fn wallet_mut(&mut self, address: &Address) -> AppResult<&mut Wallet> {
        self.wallets
            .get_mut(address)
            .ok_or_else(|| AppError::NotFound(format!("wallet {}", address)))
    }

    fn external_balance(&self, holder: &Address, asset: &AssetId) -> u128 {
        self.balances
            .get(&(holder.clone(), asset.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn credit_external(&mut self, holder: &Address, asset: &AssetId, amount: u128) {
        let balance = self
            .balances
            .entry((holder.clone(), asset.clone()))
            .or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    fn ensure_external_balance(&self, holder: &Address, asset: &AssetId, amount: u128) -> AppResult<()> {
        let available = self.external_balance(holder, asset);
        if available < amount {
            return Err(PoolError::InsufficientBalance {
                asset: asset.clone(),
                required: amount,
                available,
            }
            .into());
        }
        Ok(())
    }

    fn debit_external(&mut self, holder: &Address, asset: &AssetId, amount: u128) -> AppResult<()> {
        self.ensure_external_balance(holder, asset, amount)?;
        let key = (holder.clone(), asset.clone());
        if let Some(balance) = self.balances.get_mut(&key) {
            *balance -= amount;
        }
        Ok(())
    }

    fn settlement_gas(&self, pool: &Address) -> AppResult<u64> {
        let members = self.pool(pool)?.members().len() as u64;
        Ok(BASE_SETTLEMENT_GAS + GAS_PER_PAYOUT * members)
    }

    /// Run `op` against scratch copies of the pool and facility; commit on success
    fn execute<T, F>(&mut self, pool: &Address, op: F) -> AppResult<TxOutput<T>>
    where
        F: FnOnce(&mut PoolAccount, &mut LendingFacility, Timestamp) -> AppResult<TxOutput<T>>,
    {
        let mut scratch = self.pool(pool)?.clone();
        let mut facility = self.facility.clone();
        let output = op(&mut scratch, &mut facility, self.now)?;
        self.pools.insert(pool.clone(), scratch);
        self.facility = facility;
        Ok(output)
    }

    /// Close the current transaction into a new block
    fn seal_block(
        &mut self,
        emitter: &Address,
        events: Vec<PoolEvent>,
        transfers: Vec<Transfer>,
        gas_used: u64,
    ) -> (TxReceipt, Vec<ChainLog>) {
        self.block_number += 1;
        let block_number = self.block_number;

        let mut hasher = Sha256::new();
        hasher.update(block_number.to_be_bytes());
        hasher.update(emitter.as_str().as_bytes());
        let tx_hash = format!("0x{}", hex::encode(hasher.finalize()));

        let facility_events = self
            .facility
            .drain_events()
            .into_iter()
            .map(|event| (facility_address(), event));
        let pool_events = events.into_iter().map(|event| (emitter.clone(), event));

        let logs: Vec<ChainLog> = facility_events
            .chain(pool_events)
            .enumerate()
            .map(|(index, (address, event))| ChainLog {
                address,
                block_number,
                log_index: index as u32,
                tx_hash: tx_hash.clone(),
                event,
            })
            .collect();

        for transfer in transfers {
            self.credit_external(&transfer.to, &transfer.asset, transfer.amount);
        }
        self.logs.extend(logs.iter().cloned());

        (
            TxReceipt {
                tx_hash,
                block_number,
                gas_used,
            },
            logs,
        )
    }
}

/// Single-process chain hosting pool accounts and the lending facility
pub struct LocalChain {
    state: Mutex<ChainState>,
    feed: broadcast::Sender<ChainLog>,
    operator: Address,
}

impl LocalChain {
    pub fn new(behavior: WalletBehavior, operator: Address, genesis_time: Timestamp) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(ChainState {
                factory: WalletFactory::new(behavior),
                pools: HashMap::new(),
                wallets: HashMap::new(),
                facility: LendingFacility::new(),
                balances: HashMap::new(),
                block_number: 0,
                now: genesis_time,
                logs: Vec::new(),
                base_fee: DEFAULT_BASE_FEE,
                failing_submissions: 0,
            }),
            feed,
            operator,
        }
    }

    pub fn operator(&self) -> &Address {
        &self.operator
    }

    fn publish(&self, logs: Vec<ChainLog>) {
        for log in logs {
            // no receivers is fine; the log history still has it
            let _ = self.feed.send(log);
        }
    }

    async fn commit<T, F>(&self, pool: &Address, op: F) -> AppResult<(T, TxReceipt)>
    where
        F: FnOnce(&mut PoolAccount, &mut LendingFacility, Timestamp) -> AppResult<TxOutput<T>>,
    {
        let mut state = self.state.lock().await;
        let (value, events, transfers) = state.execute(pool, op)?;
        let (receipt, logs) = state.seal_block(pool, events, transfers, 0);
        self.publish(logs);
        Ok((value, receipt))
    }

    pub async fn now(&self) -> Timestamp {
        self.state.lock().await.now
    }

    pub async fn advance_time(&self, seconds: i64) -> Timestamp {
        let mut state = self.state.lock().await;
        state.now = state.now.saturating_add(seconds);
        state.now
    }

    pub async fn mint(&self, holder: &Address, asset: &AssetId, amount: u128) {
        self.state.lock().await.credit_external(holder, asset, amount);
    }

    pub async fn balance_of(&self, holder: &Address, asset: &AssetId) -> u128 {
        self.state.lock().await.external_balance(holder, asset)
    }

    pub async fn set_base_fee(&self, base_fee: u128) {
        self.state.lock().await.base_fee = base_fee;
    }

    /// Make the next `count` settlement submissions fail at the transport level
    pub async fn fail_next_submissions(&self, count: u32) {
        self.state.lock().await.failing_submissions = count;
    }

    pub async fn pool(&self, address: &Address) -> Option<PoolAccount> {
        self.state.lock().await.pools.get(address).cloned()
    }

    pub async fn facility(&self) -> LendingFacility {
        self.state.lock().await.facility.clone()
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create_pool(&self, params: PoolParams) -> AppResult<(Address, TxReceipt)> {
        let mut state = self.state.lock().await;
        let now = state.now;
        let account = state.factory.create_pool(params, now)?;
        let address = account.address().clone();
        state.pools.insert(address.clone(), account);

        let (receipt, logs) = state.seal_block(&address, Vec::new(), Vec::new(), 0);
        self.publish(logs);
        info!("🏦 Pool {} created", address);
        Ok((address, receipt))
    }

    pub async fn add_manager(&self, pool: &Address, caller: &Address, manager: Address) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, _, _| {
                account.add_manager(caller, manager)?;
                Ok(((), Vec::new(), Vec::new()))
            })
            .await?;
        Ok(receipt)
    }

    pub async fn add_member(
        &self,
        pool: &Address,
        caller: &Address,
        member: Address,
        payout_address: Address,
    ) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, _, now| {
                let event = account.add_member(caller, member, payout_address, now)?;
                Ok(((), vec![event], Vec::new()))
            })
            .await?;
        Ok(receipt)
    }

    pub async fn remove_member(&self, pool: &Address, caller: &Address, member: &Address) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, _, _| {
                let event = account.remove_member(caller, member)?;
                Ok(((), vec![event], Vec::new()))
            })
            .await?;
        Ok(receipt)
    }

    pub async fn pause_windows(&self, pool: &Address, caller: &Address) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, _, _| {
                account.pause_windows(caller)?;
                Ok(((), Vec::new(), Vec::new()))
            })
            .await?;
        Ok(receipt)
    }

    pub async fn resume_windows(&self, pool: &Address, caller: &Address) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, _, _| {
                account.resume_windows(caller)?;
                Ok(((), Vec::new(), Vec::new()))
            })
            .await?;
        Ok(receipt)
    }

    /// Move `amount` from the caller's external balance into the pool
    pub async fn contribute(
        &self,
        pool: &Address,
        caller: &Address,
        asset: &AssetId,
        amount: u128,
    ) -> AppResult<TxReceipt> {
        let mut state = self.state.lock().await;
        state.ensure_external_balance(caller, asset, amount)?;

        let (_, events, transfers) = state.execute(pool, |account, facility, now| {
            let events = account.contribute(caller, asset, amount, now, facility)?;
            Ok(((), events, Vec::new()))
        })?;
        state.debit_external(caller, asset, amount)?;

        let (receipt, logs) = state.seal_block(pool, events, transfers, 0);
        self.publish(logs);
        debug!("{} contributed {} {} to {}", caller, amount, asset, pool);
        Ok(receipt)
    }

    pub async fn complete_window(&self, pool: &Address, caller: &Address) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, facility, _| {
                let events = account.complete_current_window(caller, facility)?;
                Ok(((), events, Vec::new()))
            })
            .await?;
        Ok(receipt)
    }

    pub async fn cancel_pool(&self, pool: &Address, caller: &Address) -> AppResult<TxReceipt> {
        let (_, receipt) = self
            .commit(pool, |account, _, now| {
                let (events, transfers) = account.cancel(caller, now)?;
                Ok(((), events, transfers))
            })
            .await?;
        Ok(receipt)
    }

    /// Interest credited by the facility to a pool's receipt balance
    pub async fn accrue_yield(&self, pool: &Address, asset: &AssetId, amount: u128) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.pool(pool)?;
        state.facility.accrue(pool, asset, amount);
        Ok(())
    }

    pub async fn haircut_yield(&self, pool: &Address, asset: &AssetId, loss: u128) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.pool(pool)?;
        state.facility.haircut(pool, asset, loss);
        Ok(())
    }

    pub async fn create_wallet(&self, owner: Address) -> Address {
        let mut state = self.state.lock().await;
        let wallet = state.factory.create_personal_wallet(owner);
        let address = wallet.address.clone();
        state.wallets.insert(address.clone(), wallet);
        address
    }

    pub async fn wallet_balance(&self, wallet: &Address, asset: &AssetId) -> AppResult<u128> {
        let mut state = self.state.lock().await;
        Ok(state.wallet_mut(wallet)?.balance(asset))
    }

    pub async fn wallet_deposit(
        &self,
        wallet: &Address,
        caller: &Address,
        asset: &AssetId,
        amount: u128,
    ) -> AppResult<TxReceipt> {
        let mut state = self.state.lock().await;
        state.ensure_external_balance(caller, asset, amount)?;
        state.wallet_mut(wallet)?.deposit(asset, amount)?;
        state.debit_external(caller, asset, amount)?;

        let (receipt, logs) = state.seal_block(wallet, Vec::new(), Vec::new(), 0);
        self.publish(logs);
        Ok(receipt)
    }

    pub async fn wallet_withdraw(
        &self,
        wallet: &Address,
        caller: &Address,
        asset: &AssetId,
        amount: u128,
        to: Address,
    ) -> AppResult<TxReceipt> {
        let mut state = self.state.lock().await;
        let transfer = state.wallet_mut(wallet)?.withdraw(caller, asset, amount, to)?;

        let (receipt, logs) = state.seal_block(wallet, Vec::new(), vec![transfer], 0);
        self.publish(logs);
        Ok(receipt)
    }

    pub async fn wallet_supply(
        &self,
        wallet: &Address,
        caller: &Address,
        asset: &AssetId,
        amount: u128,
    ) -> AppResult<TxReceipt> {
        let mut state = self.state.lock().await;
        let mut facility = state.facility.clone();
        let event = state
            .wallet_mut(wallet)?
            .supply_to_yield(caller, &mut facility, asset, amount)?;
        state.facility = facility;

        let (receipt, logs) = state.seal_block(wallet, vec![event], Vec::new(), 0);
        self.publish(logs);
        Ok(receipt)
    }

    pub async fn wallet_withdraw_yield(
        &self,
        wallet: &Address,
        caller: &Address,
        asset: &AssetId,
        amount: WithdrawAmount,
    ) -> AppResult<TxReceipt> {
        let mut state = self.state.lock().await;
        let mut facility = state.facility.clone();
        let (received, event) = state
            .wallet_mut(wallet)?
            .withdraw_from_yield(caller, &mut facility, asset, amount)?;
        state.facility = facility;
        debug!("Wallet {} withdrew {} of {} from yield", wallet, received, asset);

        let (receipt, logs) = state.seal_block(wallet, vec![event], Vec::new(), 0);
        self.publish(logs);
        Ok(receipt)
    }
}

#[async_trait]
impl ChainGateway for LocalChain {
    async fn block_number(&self) -> AppResult<BlockNumber> {
        Ok(self.state.lock().await.block_number)
    }

    async fn pool_snapshot(&self, pool: &Address) -> AppResult<PoolSnapshot> {
        let state = self.state.lock().await;
        let account = state.pool(pool)?;
        Ok(PoolSnapshot {
            address: account.address().clone(),
            name: account.name().to_string(),
            owner: account.owner().clone(),
            status: account.status(),
            lock_until: account.lock_until(),
            lock_period: account.lock_period(),
            current_window: account.windows().current_window_number(),
            member_count: account.members().len(),
        })
    }

    async fn check_eligibility(&self, pool: &Address) -> AppResult<Eligibility> {
        let state = self.state.lock().await;
        let account = state.pool(pool)?;
        Ok(Eligibility {
            status: account.status(),
            lock_elapsed: account.is_lock_elapsed(state.now),
            claims: account.custody_claims(&state.facility),
        })
    }

    async fn estimate_settlement_gas(&self, pool: &Address, _asset: &AssetId) -> AppResult<u64> {
        self.state.lock().await.settlement_gas(pool)
    }

    #[instrument(skip(self, gas), fields(gas_limit = gas.gas_limit))]
    async fn submit_settlement(
        &self,
        pool: &Address,
        asset: &AssetId,
        gas: GasParams,
    ) -> AppResult<TxReceipt> {
        let mut state = self.state.lock().await;

        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(ChainError::Rpc("connection reset by peer".to_string()).into());
        }
        if gas.fee.max_fee_per_gas < state.base_fee {
            return Err(ChainError::Underpriced {
                offered: gas.fee.max_fee_per_gas,
                required: state.base_fee,
            }
            .into());
        }
        let estimate = state.settlement_gas(pool)?;
        if gas.gas_limit < estimate {
            return Err(ChainError::Reverted {
                reason: "out of gas".to_string(),
            }
            .into());
        }

        let result = state.execute(pool, |account, facility, now| {
            let outcome = account.settle_asset(asset, now, facility)?;
            Ok(((), outcome.events, outcome.transfers))
        });

        let (_, events, transfers) = match result {
            Ok(output) => output,
            Err(err) if err.is_business_rule() && !matches!(err, AppError::Chain(_)) => {
                warn!("Settlement of {} for {} reverted: {}", asset, pool, err);
                return Err(ChainError::Reverted {
                    reason: err.to_string(),
                }
                .into());
            }
            Err(err) => return Err(err),
        };

        let (receipt, logs) = state.seal_block(pool, events, transfers, estimate);
        self.publish(logs);
        info!(
            "⛓️  Settlement of {} for {} mined in block {} ({})",
            asset, pool, receipt.block_number, receipt.tx_hash
        );
        Ok(receipt)
    }
}

#[async_trait]
impl FeeOracle for LocalChain {
    async fn fee_quote(&self) -> AppResult<FeeQuote> {
        let base_fee = self.state.lock().await.base_fee;
        Ok(FeeQuote {
            max_fee_per_gas: base_fee.saturating_mul(2).saturating_add(PRIORITY_FEE),
            max_priority_fee_per_gas: PRIORITY_FEE,
        })
    }
}

#[async_trait]
impl EventSource for LocalChain {
    async fn subscribe(&self) -> AppResult<broadcast::Receiver<ChainLog>> {
        Ok(self.feed.subscribe())
    }

    async fn logs(&self, pool: &Address, from: BlockNumber, to: BlockNumber) -> AppResult<Vec<ChainLog>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .filter(|log| &log.address == pool && log.block_number >= from && log.block_number <= to)
            .cloned()
            .collect())
    }

    async fn transaction_logs(&self, tx_hash: &str) -> AppResult<Vec<ChainLog>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .filter(|log| log.tx_hash == tx_hash)
            .cloned()
            .collect())
    }

    async fn head_block(&self) -> AppResult<BlockNumber> {
        Ok(self.state.lock().await.block_number)
    }
}
