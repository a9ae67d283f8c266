//! In-memory collaborator doubles for engine and supervisor tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, U256};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::database::Persistence;
use crate::engine::OpportunityEngine;
use crate::executor::{TradeExecutor, TradeOutcome, TradeRequest};
use crate::models::{
    ArbitrageContract, Blockchain, Dex, NewDex, NewTokenPair, Opportunity, PairRef, PriceRecord,
    SwapEvent, TokenPair, TradeRecord,
};
use crate::monitor::{MonitorHandle, MonitorSupervisor, MonitorTable};
use crate::registry::{ChainClient, ListenerKey, RegistryError};

pub fn addr(tag: u8) -> Address {
    Address::from_low_u64_be(tag as u64)
}

/// Deterministic pool handle for a (blockchain, dex) combination, matching
/// what [`StubChain::pair_address`] resolves.
pub fn pair_ref(blockchain_id: i64, dex_id: i64) -> PairRef {
    PairRef {
        blockchain_id,
        dex_id,
        address: Address::from_low_u64_be(0xB00 + (blockchain_id as u64) * 16 + dex_id as u64),
        token0: addr(0x01),
        token1: addr(0x02),
        token0_decimals: 18,
        token1_decimals: 6,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RouterQuote {
    /// amount_out = amount_in * numerator / denominator.
    Linear { numerator: u64, denominator: u64 },
    Fails,
}

#[derive(Default)]
pub struct StubChain {
    reserves: Mutex<HashMap<Address, (U256, U256)>>,
    failing_reserves: Mutex<HashSet<Address>>,
    routers: Mutex<HashMap<Address, RouterQuote>>,
    failing_pair_lookups: Mutex<HashSet<i64>>,
    listeners: Mutex<HashMap<ListenerKey, mpsc::Sender<SwapEvent>>>,
    gas_price_wei: Mutex<Option<U256>>,
    reserve_delay: Mutex<Option<Duration>>,
    reserve_calls: AtomicUsize,
    quote_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    closed: AtomicBool,
}

impl StubChain {
    pub fn set_reserves(&self, pool: Address, reserve0: U256, reserve1: U256) {
        self.reserves.lock().insert(pool, (reserve0, reserve1));
        self.failing_reserves.lock().remove(&pool);
    }

    pub fn fail_reserves(&self, pool: Address) {
        self.failing_reserves.lock().insert(pool);
    }

    pub fn set_router(&self, router: Address, quote: RouterQuote) {
        self.routers.lock().insert(router, quote);
    }

    pub fn fail_pair_lookup(&self, dex_id: i64) {
        self.failing_pair_lookups.lock().insert(dex_id);
    }

    pub fn set_reserve_delay(&self, delay: Duration) {
        *self.reserve_delay.lock() = Some(delay);
    }

    pub fn reserve_calls(&self) -> usize {
        self.reserve_calls.load(Ordering::SeqCst)
    }

    pub fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pushes a swap notification through a registered listener channel, as
    /// the real registry's streaming task would.
    pub async fn emit_swap(&self, event: SwapEvent) {
        let sender = self
            .listeners
            .lock()
            .values()
            .next()
            .cloned()
            .expect("no swap listeners registered");
        sender.send(event).await.expect("dispatcher not running");
    }

    fn quote(&self, router: Address, amount: U256, invert: bool) -> Result<U256, RegistryError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        match self.routers.lock().get(&router) {
            Some(RouterQuote::Linear { numerator, denominator }) => {
                let (numerator, denominator) = if invert {
                    (*denominator, *numerator)
                } else {
                    (*numerator, *denominator)
                };
                Ok(amount * U256::from(numerator) / U256::from(denominator))
            }
            Some(RouterQuote::Fails) => Err(RegistryError::Call(
                "execution reverted: INSUFFICIENT_LIQUIDITY".to_string(),
            )),
            None => Err(RegistryError::Call(format!("router {router:?} not programmed"))),
        }
    }
}

#[async_trait]
impl ChainClient for StubChain {
    async fn pair_address(
        &self,
        blockchain_id: i64,
        dex_id: i64,
        _factory: Address,
        _token0: Address,
        _token1: Address,
    ) -> Result<Address, RegistryError> {
        if self.failing_pair_lookups.lock().contains(&dex_id) {
            return Err(RegistryError::Call("execution reverted".to_string()));
        }
        Ok(pair_ref(blockchain_id, dex_id).address)
    }

    async fn pair_reserves(
        &self,
        _blockchain_id: i64,
        pair: Address,
    ) -> Result<(U256, U256), RegistryError> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.reserve_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_reserves.lock().contains(&pair) {
            return Err(RegistryError::Call("connection reset".to_string()));
        }
        self.reserves
            .lock()
            .get(&pair)
            .copied()
            .ok_or_else(|| RegistryError::Call(format!("no pool at {pair:?}")))
    }

    async fn amounts_out(
        &self,
        _blockchain_id: i64,
        router: Address,
        amount_in: U256,
        path: Vec<Address>,
    ) -> Result<Vec<U256>, RegistryError> {
        let out = self.quote(router, amount_in, false)?;
        assert_eq!(path.len(), 2);
        Ok(vec![amount_in, out])
    }

    async fn amounts_in(
        &self,
        _blockchain_id: i64,
        router: Address,
        amount_out: U256,
        path: Vec<Address>,
    ) -> Result<Vec<U256>, RegistryError> {
        let input = self.quote(router, amount_out, true)?;
        assert_eq!(path.len(), 2);
        Ok(vec![input, amount_out])
    }

    async fn gas_price(&self, _blockchain_id: i64) -> Result<U256, RegistryError> {
        // 1 gwei unless a test overrides it.
        Ok((*self.gas_price_wei.lock()).unwrap_or_else(|| U256::exp10(9)))
    }

    async fn block_number(&self, _blockchain_id: i64) -> Result<u64, RegistryError> {
        Ok(1)
    }

    async fn monitor_swap_events(
        &self,
        blockchain_id: i64,
        pair: Address,
        token_pair_id: i64,
        dex_id: i64,
        events: mpsc::Sender<SwapEvent>,
    ) -> Result<ListenerKey, RegistryError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let key = format!("{blockchain_id}_{pair:#x}_{dex_id}_{token_pair_id}");
        self.listeners.lock().insert(key.clone(), events);
        Ok(key)
    }

    fn remove_swap_listener(&self, key: &str) {
        self.listeners.lock().remove(key);
    }

    fn close_all(&self) {
        self.listeners.lock().clear();
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct StubPersistence {
    blockchains: Mutex<Vec<Blockchain>>,
    dexes: Mutex<Vec<Dex>>,
    pairs: Mutex<Vec<TokenPair>>,
    contracts: Mutex<Vec<ArbitrageContract>>,
    prices: Mutex<Vec<PriceRecord>>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl StubPersistence {
    /// One active blockchain with two DEXes, one WETH/USDC pair (1% minimum
    /// price difference) and one arbitrage contract.
    pub fn seeded() -> Self {
        Self {
            blockchains: Mutex::new(vec![Blockchain {
                id: 1,
                name: "Polygon".to_string(),
                chain_id: 137,
                rpc_url: "https://rpc.example".to_string(),
                ws_url: None,
                explorer_url: None,
                native_token: "MATIC".to_string(),
                gas_multiplier: dec!(1.1),
                is_active: true,
            }]),
            dexes: Mutex::new(vec![dex_fixture(1), dex_fixture(2)]),
            pairs: Mutex::new(vec![token_pair_fixture(1)]),
            contracts: Mutex::new(vec![ArbitrageContract {
                id: 1,
                blockchain_id: 1,
                address: format!("{:?}", addr(0xCC)),
                flash_loan_provider: "balancer".to_string(),
                is_active: true,
            }]),
            prices: Mutex::new(Vec::new()),
            trades: Mutex::new(Vec::new()),
        }
    }

    pub async fn token_pair(&self, id: i64) -> TokenPair {
        self.pairs
            .lock()
            .iter()
            .find(|pair| pair.id == id)
            .cloned()
            .expect("token pair fixture missing")
    }

    pub async fn dex(&self, id: i64) -> Dex {
        self.dexes
            .lock()
            .iter()
            .find(|dex| dex.id == id)
            .cloned()
            .expect("dex fixture missing")
    }

    pub async fn remove_dex(&self, id: i64) {
        self.dexes.lock().retain(|dex| dex.id != id);
    }

    pub fn logged_prices(&self) -> Vec<PriceRecord> {
        self.prices.lock().clone()
    }

    pub fn logged_trades(&self) -> Vec<TradeRecord> {
        self.trades.lock().clone()
    }
}

#[async_trait]
impl Persistence for StubPersistence {
    async fn get_blockchains(&self, active_only: bool) -> Result<Vec<Blockchain>> {
        Ok(self
            .blockchains
            .lock()
            .iter()
            .filter(|chain| chain.is_active || !active_only)
            .cloned()
            .collect())
    }

    async fn get_blockchain(&self, id: i64) -> Result<Option<Blockchain>> {
        Ok(self.blockchains.lock().iter().find(|chain| chain.id == id).cloned())
    }

    async fn get_dexes(&self, blockchain_id: i64, active_only: bool) -> Result<Vec<Dex>> {
        Ok(self
            .dexes
            .lock()
            .iter()
            .filter(|dex| dex.blockchain_id == blockchain_id && (dex.is_active || !active_only))
            .cloned()
            .collect())
    }

    async fn get_dex(&self, id: i64) -> Result<Option<Dex>> {
        Ok(self.dexes.lock().iter().find(|dex| dex.id == id).cloned())
    }

    async fn get_token_pairs(
        &self,
        blockchain_id: Option<i64>,
        active_only: bool,
    ) -> Result<Vec<TokenPair>> {
        Ok(self
            .pairs
            .lock()
            .iter()
            .filter(|pair| {
                blockchain_id.is_none_or(|id| pair.blockchain_id == id)
                    && (pair.is_active || !active_only)
            })
            .cloned()
            .collect())
    }

    async fn get_token_pair(&self, blockchain_id: i64, id: i64) -> Result<Option<TokenPair>> {
        Ok(self
            .pairs
            .lock()
            .iter()
            .find(|pair| pair.blockchain_id == blockchain_id && pair.id == id)
            .cloned())
    }

    async fn get_arbitrage_contracts(
        &self,
        blockchain_id: i64,
        active_only: bool,
    ) -> Result<Vec<ArbitrageContract>> {
        Ok(self
            .contracts
            .lock()
            .iter()
            .filter(|contract| {
                contract.blockchain_id == blockchain_id && (contract.is_active || !active_only)
            })
            .cloned()
            .collect())
    }

    async fn insert_token_pair(&self, new_pair: &NewTokenPair) -> Result<i64> {
        let mut pairs = self.pairs.lock();
        let id = pairs.iter().map(|pair| pair.id).max().unwrap_or(0) + 1;
        let mut pair = token_pair_fixture(id);
        pair.blockchain_id = new_pair.blockchain_id;
        pair.min_price_difference = new_pair.min_price_difference;
        pair.is_active = new_pair.is_active;
        pairs.push(pair);
        Ok(id)
    }

    async fn insert_dex(&self, new_dex: &NewDex) -> Result<i64> {
        let mut dexes = self.dexes.lock();
        let id = dexes.iter().map(|dex| dex.id).max().unwrap_or(0) + 1;
        dexes.push(Dex {
            id,
            blockchain_id: new_dex.blockchain_id,
            name: new_dex.name.clone(),
            router_address: new_dex.router_address.clone(),
            factory_address: new_dex.factory_address.clone(),
            version: new_dex.version.clone(),
            is_active: new_dex.is_active,
        });
        Ok(id)
    }

    async fn log_price(&self, record: &PriceRecord) -> Result<()> {
        self.prices.lock().push(record.clone());
        Ok(())
    }

    async fn log_arbitrage_transaction(&self, record: &TradeRecord) -> Result<()> {
        self.trades.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubConfig {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ConfigStore for StubConfig {
    async fn get_config(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(name).cloned())
    }

    async fn set_config(&self, name: &str, value: &str) -> Result<()> {
        self.values.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubExecutor {
    requests: Mutex<Vec<TradeRequest>>,
    fail_next: AtomicBool,
}

impl StubExecutor {
    pub fn requests(&self) -> Vec<TradeRequest> {
        self.requests.lock().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TradeExecutor for StubExecutor {
    async fn execute(&self, request: &TradeRequest) -> Result<TradeOutcome> {
        self.requests.lock().push(request.clone());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("execution reverted"));
        }
        Ok(TradeOutcome {
            tx_hash: "0xdeadbeef".to_string(),
            amount_out: dec!(1.02),
            profit: dec!(0.02),
            gas_used: dec!(210000),
            gas_price: dec!(1000000000),
        })
    }
}

pub fn dex_fixture(id: i64) -> Dex {
    Dex {
        id,
        blockchain_id: 1,
        name: format!("dex-{id}"),
        router_address: format!("{:?}", addr(0xA0 + id as u8)),
        factory_address: format!("{:?}", addr(0xF0 + id as u8)),
        version: "v2".to_string(),
        is_active: true,
    }
}

pub fn token_pair_fixture(id: i64) -> TokenPair {
    TokenPair {
        id,
        blockchain_id: 1,
        token0_id: 1,
        token1_id: 2,
        min_price_difference: dec!(1.0),
        is_active: true,
        token0_address: format!("{:?}", addr(0x01)),
        token0_symbol: "WETH".to_string(),
        token0_decimals: 18,
        token1_address: format!("{:?}", addr(0x02)),
        token1_symbol: "USDC".to_string(),
        token1_decimals: 6,
    }
}

pub fn opportunity_fixture(token_pair_id: i64) -> Opportunity {
    Opportunity {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        blockchain_id: 1,
        token_pair_id,
        buy_dex: dex_fixture(1),
        sell_dex: dex_fixture(2),
        buy_pair: pair_ref(1, 1),
        sell_pair: pair_ref(1, 2),
        price_difference_pct: dec!(2.5),
        estimated_profit_pct: dec!(1.9),
        amount_in: Some(U256::exp10(18)),
        net_profit: Some(dec!(0.019)),
        gas_cost: Some(dec!(0.0004)),
    }
}

pub struct TestHarness {
    pub chain: Arc<StubChain>,
    pub db: Arc<StubPersistence>,
    pub config: Arc<StubConfig>,
    pub executor: Arc<StubExecutor>,
    pub monitors: Arc<MonitorTable>,
    pub engine: Arc<OpportunityEngine>,
}

/// Harness with the pair already monitored on both DEXes, for engine tests.
pub async fn harness() -> TestHarness {
    build_harness(true, false).await
}

/// Same, but with execution enabled from the start.
pub async fn harness_with_execution() -> TestHarness {
    build_harness(true, true).await
}

/// Harness with an empty monitor table, for supervisor tests.
pub async fn bare_harness() -> TestHarness {
    build_harness(false, false).await
}

pub fn supervisor(h: &TestHarness) -> Arc<MonitorSupervisor> {
    MonitorSupervisor::new(
        Arc::clone(&h.engine),
        h.chain.clone(),
        h.db.clone(),
        Arc::clone(&h.monitors),
    )
}

async fn build_harness(seed_monitors: bool, execution_enabled: bool) -> TestHarness {
    let chain = Arc::new(StubChain::default());
    let db = Arc::new(StubPersistence::seeded());
    let config = Arc::new(StubConfig::default());
    if execution_enabled {
        config
            .set_config(crate::config::keys::EXECUTION_ENABLED, "true")
            .await
            .unwrap();
    }
    let executor = Arc::new(StubExecutor::default());
    let monitors = Arc::new(MonitorTable::new());
    if seed_monitors {
        for dex_id in [1, 2] {
            monitors.insert(
                (1, 1, dex_id),
                MonitorHandle {
                    listener_key: format!("seed_{dex_id}"),
                    pair: pair_ref(1, dex_id),
                },
            );
        }
    }

    let engine = OpportunityEngine::new(
        chain.clone(),
        db.clone(),
        config.clone(),
        executor.clone(),
        Arc::clone(&monitors),
    )
    .await
    .unwrap();

    TestHarness {
        chain,
        db,
        config,
        executor,
        monitors,
        engine,
    }
}

/// Buy leg swaps 1:1, sell leg pays out 2%: a clearly profitable round trip
/// once gas at the stub's 1 gwei is charged.
pub fn profitable_routers(h: &TestHarness) {
    let dex1 = dex_fixture(1);
    let dex2 = dex_fixture(2);
    h.chain.set_router(
        dex1.router().unwrap(),
        RouterQuote::Linear { numerator: 1, denominator: 1 },
    );
    h.chain.set_router(
        dex2.router().unwrap(),
        RouterQuote::Linear { numerator: 102, denominator: 100 },
    );
}
