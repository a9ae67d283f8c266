use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use ethers::types::Address;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::database::Persistence;
use crate::engine::OpportunityEngine;
use crate::models::{Dex, NewDex, NewTokenPair, PairRef, SwapEvent, TokenPair};
use crate::registry::{ChainClient, ListenerKey};

/// Swap notifications queued between chain listeners and the dispatcher.
const SWAP_EVENT_BUFFER: usize = 256;

/// (blockchain_id, token_pair_id, dex_id)
pub type MonitorKey = (i64, i64, i64);

/// One active swap-event subscription and the pool it watches.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    pub listener_key: ListenerKey,
    pub pair: PairRef,
}

/// Which pools are currently monitored, shared between the supervisor (which
/// registers and tears down handles) and the engine (which samples prices
/// from whatever is monitored right now).
#[derive(Default)]
pub struct MonitorTable {
    handles: DashMap<MonitorKey, MonitorHandle>,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle, returning the one it replaced, if any.
    pub fn insert(&self, key: MonitorKey, handle: MonitorHandle) -> Option<MonitorHandle> {
        self.handles.insert(key, handle)
    }

    /// The monitored (dex_id, pool) set for one token pair.
    pub fn pair_monitors(&self, blockchain_id: i64, token_pair_id: i64) -> Vec<(i64, PairRef)> {
        self.handles
            .iter()
            .filter(|entry| entry.key().0 == blockchain_id && entry.key().1 == token_pair_id)
            .map(|entry| (entry.key().2, entry.value().pair.clone()))
            .collect()
    }

    /// Removes and returns every handle.
    pub fn drain(&self) -> Vec<MonitorHandle> {
        let keys: Vec<MonitorKey> = self.handles.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.handles.remove(&key).map(|(_, handle)| handle))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Sets up and tears down swap-event monitoring for every active token pair,
/// and pumps incoming events into per-pair engine evaluations.
pub struct MonitorSupervisor {
    engine: Arc<OpportunityEngine>,
    chain: Arc<dyn ChainClient>,
    db: Arc<dyn Persistence>,
    monitors: Arc<MonitorTable>,
    events: mpsc::Sender<SwapEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorSupervisor {
    pub fn new(
        engine: Arc<OpportunityEngine>,
        chain: Arc<dyn ChainClient>,
        db: Arc<dyn Persistence>,
        monitors: Arc<MonitorTable>,
    ) -> Arc<Self> {
        let (events, receiver) = mpsc::channel(SWAP_EVENT_BUFFER);
        let dispatcher = tokio::spawn(Self::dispatch_events(receiver, Arc::clone(&engine)));

        Arc::new(Self {
            engine,
            chain,
            db,
            monitors,
            events,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// One detached evaluation per event; the engine's per-pair lock sheds
    /// bursts, so a slow evaluation never blocks other pairs.
    async fn dispatch_events(mut receiver: mpsc::Receiver<SwapEvent>, engine: Arc<OpportunityEngine>) {
        while let Some(event) = receiver.recv().await {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.handle_swap_event(event).await;
            });
        }
    }

    pub async fn start_monitoring(&self) -> Result<()> {
        let pairs = self.db.get_token_pairs(None, true).await?;
        if pairs.is_empty() {
            log::info!("No active token pairs configured for monitoring");
            return Ok(());
        }

        log::info!("Starting monitoring for {} active token pairs", pairs.len());
        for pair in &pairs {
            self.monitor_token_pair(pair).await?;
        }
        Ok(())
    }

    /// Subscribes to swaps on every active DEX's pool for the pair. Arbitrage
    /// needs at least two venues; below that the pair is skipped entirely.
    /// Re-invocable: existing listeners are replaced, never stacked.
    pub async fn monitor_token_pair(&self, pair: &TokenPair) -> Result<()> {
        let dexes = self.db.get_dexes(pair.blockchain_id, true).await?;
        if dexes.len() < 2 {
            log::info!(
                "Skipping token pair {} - need at least 2 DEXes on blockchain {}",
                pair.id,
                pair.blockchain_id
            );
            return Ok(());
        }

        log::info!(
            "Setting up monitoring for token pair {} on blockchain {}",
            pair.symbol(),
            pair.blockchain_id
        );

        let token0 = pair.token0()?;
        let token1 = pair.token1()?;
        for dex in &dexes {
            if let Err(e) = self.monitor_dex(pair, dex, token0, token1).await {
                log::error!("Failed to set up monitoring for DEX {}: {e:#}", dex.name);
            }
        }
        Ok(())
    }

    async fn monitor_dex(
        &self,
        pair: &TokenPair,
        dex: &Dex,
        token0: Address,
        token1: Address,
    ) -> Result<()> {
        let factory = dex.factory()?;
        let address = self
            .chain
            .pair_address(pair.blockchain_id, dex.id, factory, token0, token1)
            .await?;

        let pair_ref = PairRef {
            blockchain_id: pair.blockchain_id,
            dex_id: dex.id,
            address,
            token0,
            token1,
            token0_decimals: pair.token0_decimals as u32,
            token1_decimals: pair.token1_decimals as u32,
        };
        let listener_key = self
            .chain
            .monitor_swap_events(pair.blockchain_id, address, pair.id, dex.id, self.events.clone())
            .await?;

        let replaced = self.monitors.insert(
            (pair.blockchain_id, pair.id, dex.id),
            MonitorHandle {
                listener_key: listener_key.clone(),
                pair: pair_ref,
            },
        );
        // The registry already replaced a listener with the same key; only a
        // handle pointing at a different pool still needs detaching.
        if let Some(old) = replaced {
            if old.listener_key != listener_key {
                self.chain.remove_swap_listener(&old.listener_key);
            }
        }

        log::info!("Monitoring {} for {} swaps", dex.name, pair.symbol());
        Ok(())
    }

    /// Persists a new pair and starts monitoring it.
    pub async fn add_token_pair(&self, new_pair: NewTokenPair) -> Result<i64> {
        let blockchain_id = new_pair.blockchain_id;
        let id = self.db.insert_token_pair(&new_pair).await?;
        if let Some(pair) = self.db.get_token_pair(blockchain_id, id).await? {
            self.monitor_token_pair(&pair).await?;
        }
        Ok(id)
    }

    /// Persists a new DEX and refreshes monitoring for every pair on its
    /// blockchain so the new venue is included.
    pub async fn add_dex(&self, new_dex: NewDex) -> Result<i64> {
        let blockchain_id = new_dex.blockchain_id;
        let id = self.db.insert_dex(&new_dex).await?;

        let pairs = self.db.get_token_pairs(Some(blockchain_id), true).await?;
        for pair in &pairs {
            self.monitor_token_pair(pair).await?;
        }
        Ok(id)
    }

    /// Detaches every listener and releases chain connections. Idempotent.
    pub async fn stop(&self) {
        log::info!("Stopping arbitrage bot...");

        for handle in self.monitors.drain() {
            self.chain.remove_swap_listener(&handle.listener_key);
        }
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        self.chain.close_all();

        log::info!("Arbitrage bot stopped");
    }
}
