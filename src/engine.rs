use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ethers::types::U256;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::{BotSettings, ConfigStore, keys};
use crate::database::Persistence;
use crate::executor::{TradeExecutor, TradeRequest};
use crate::models::{
    Opportunity, PriceRecord, PriceSample, SwapEvent, TokenPair, TradeRecord, TradeStatus,
};
use crate::monitor::MonitorTable;
use crate::price;
use crate::registry::ChainClient;
use crate::simulator;

/// Detected-but-unexecuted opportunities kept for the dashboard, oldest
/// evicted first.
const OPPORTUNITY_LOG_CAPACITY: usize = 100;

/// Gas costs are charged against profit assuming token0 is the chain's
/// wrapped native token, so token0 profit converts 1:1 into native units.
/// A price oracle would replace this constant.
const NATIVE_PER_TOKEN0: Decimal = Decimal::ONE;

/// Native-token decimals used when formatting gas costs.
const NATIVE_DECIMALS: u32 = 18;

/// Where one swap-event evaluation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Another evaluation already held the pair's lock; the event was shed.
    Skipped,
    /// Fewer than two usable samples, or divergence under the pair threshold.
    NoOpportunity,
    /// Divergence found, but the refined net profit missed the threshold.
    NotProfitable,
    /// Profitable with execution disabled; pushed to the opportunity log.
    Recorded,
    /// Profitable and handed to the executor.
    Dispatched,
    /// Evaluation errored; logged and swallowed here.
    Failed,
}

type LockKey = (i64, i64);

/// Releases the per-pair execution lock on every exit path, errors included.
struct LockGuard {
    locks: Arc<DashMap<LockKey, ()>>,
    key: LockKey,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.remove(&self.key);
    }
}

/// Reacts to swap events: re-samples prices across a pair's monitored DEXes,
/// detects divergence, refines profitability with router quotes and gas, and
/// either records the opportunity or dispatches it for execution. At most one
/// evaluation runs per (blockchain, pair) at any time; colliding events are
/// dropped rather than queued.
pub struct OpportunityEngine {
    chain: Arc<dyn ChainClient>,
    db: Arc<dyn Persistence>,
    config: Arc<dyn ConfigStore>,
    executor: Arc<dyn TradeExecutor>,
    monitors: Arc<MonitorTable>,
    locks: Arc<DashMap<LockKey, ()>>,
    opportunities: Mutex<VecDeque<Opportunity>>,
    settings: BotSettings,
    execution_enabled: AtomicBool,
}

impl OpportunityEngine {
    pub async fn new(
        chain: Arc<dyn ChainClient>,
        db: Arc<dyn Persistence>,
        config: Arc<dyn ConfigStore>,
        executor: Arc<dyn TradeExecutor>,
        monitors: Arc<MonitorTable>,
    ) -> Result<Arc<Self>> {
        let settings = BotSettings::load(config.as_ref()).await?;
        log::info!(
            "Engine initialized with execution {}",
            if settings.execution_enabled { "enabled" } else { "disabled" }
        );

        Ok(Arc::new(Self {
            chain,
            db,
            config,
            executor,
            monitors,
            locks: Arc::new(DashMap::new()),
            opportunities: Mutex::new(VecDeque::with_capacity(OPPORTUNITY_LOG_CAPACITY)),
            execution_enabled: AtomicBool::new(settings.execution_enabled),
            settings,
        }))
    }

    /// Snapshot of recent recorded opportunities, oldest first.
    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.opportunities.lock().iter().cloned().collect()
    }

    pub fn execution_enabled(&self) -> bool {
        self.execution_enabled.load(Ordering::Relaxed)
    }

    pub async fn set_execution_enabled(&self, enabled: bool) -> Result<()> {
        self.config
            .set_config(keys::EXECUTION_ENABLED, if enabled { "true" } else { "false" })
            .await?;
        self.execution_enabled.store(enabled, Ordering::Relaxed);
        log::info!("Execution mode {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Entry point for swap notifications. Everything that can go wrong in an
    /// evaluation is logged and swallowed here so one pair's failure never
    /// interrupts the listeners, and the lock always releases.
    pub async fn handle_swap_event(&self, event: SwapEvent) -> EvaluationOutcome {
        let key = (event.blockchain_id, event.token_pair_id);
        let Some(_guard) = self.try_lock(key) else {
            log::info!(
                "Already processing an arbitrage for {}_{}, skipping",
                event.blockchain_id,
                event.token_pair_id
            );
            return EvaluationOutcome::Skipped;
        };

        match self.evaluate(&event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(
                    "Error processing swap event for {}_{}: {e:#}",
                    event.blockchain_id,
                    event.token_pair_id
                );
                EvaluationOutcome::Failed
            }
        }
    }

    fn try_lock(&self, key: LockKey) -> Option<LockGuard> {
        match self.locks.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(LockGuard {
                    locks: Arc::clone(&self.locks),
                    key,
                })
            }
        }
    }

    async fn evaluate(&self, event: &SwapEvent) -> Result<EvaluationOutcome> {
        let pair = self
            .db
            .get_token_pair(event.blockchain_id, event.token_pair_id)
            .await?
            .with_context(|| format!("token pair {} not found", event.token_pair_id))?;

        if let Ok(Some(trigger)) = self.db.get_dex(event.dex_id).await {
            log::info!("Swap detected on {} for {}", trigger.name, pair.symbol());
        }

        let Some(mut opportunity) = self.find_arbitrage_opportunity(&pair).await? else {
            log::info!("No arbitrage opportunity found for {}", pair.symbol());
            return Ok(EvaluationOutcome::NoOpportunity);
        };

        if !self.check_profitability(&pair, &mut opportunity).await? {
            log::info!("Opportunity found but not profitable for {}", pair.symbol());
            return Ok(EvaluationOutcome::NotProfitable);
        }

        if self.execution_enabled() {
            self.execute_trade(&pair, &opportunity).await?;
            Ok(EvaluationOutcome::Dispatched)
        } else {
            log::info!(
                "Profitable opportunity found but execution is disabled: buy on {}, sell on {}, estimated profit {:.2}%",
                opportunity.buy_dex.name,
                opportunity.sell_dex.name,
                opportunity.estimated_profit_pct
            );
            self.record_opportunity(opportunity);
            Ok(EvaluationOutcome::Recorded)
        }
    }

    /// Samples every monitored DEX for the pair. A failed sample excludes
    /// that DEX from the round; it never aborts the evaluation.
    pub async fn check_prices(&self, pair: &TokenPair) -> Result<Vec<PriceSample>> {
        let monitors = self.monitors.pair_monitors(pair.blockchain_id, pair.id);
        if monitors.is_empty() {
            return Ok(Vec::new());
        }

        log::info!("Checking prices for {}...", pair.symbol());
        match self.chain.block_number(pair.blockchain_id).await {
            Ok(block) => log::debug!("Current block: {block}"),
            Err(e) => log::debug!("Block number unavailable: {e}"),
        }

        let mut samples = Vec::with_capacity(monitors.len());
        for (dex_id, pair_ref) in monitors {
            let dex = match self.db.get_dex(dex_id).await {
                Ok(Some(dex)) => dex,
                Ok(None) => {
                    log::warn!("Dex {dex_id} no longer configured, excluding from round");
                    continue;
                }
                Err(e) => {
                    log::warn!("Error loading dex {dex_id}: {e:#}");
                    continue;
                }
            };

            let sampled = match price::sample_price(self.chain.as_ref(), &pair_ref).await {
                Ok(sampled) => sampled,
                Err(e) => {
                    log::warn!(
                        "Error getting {} price for {}: {e:#}",
                        dex.name,
                        pair.symbol()
                    );
                    continue;
                }
            };

            log::info!(
                "{:<15} | {}/{} | {:.6}",
                dex.name,
                pair.token1_symbol,
                pair.token0_symbol,
                sampled
            );
            if let Err(e) = self
                .db
                .log_price(&PriceRecord {
                    blockchain_id: pair.blockchain_id,
                    token_pair_id: pair.id,
                    dex_id,
                    price: sampled,
                })
                .await
            {
                log::warn!("Failed to log price for dex {dex_id}: {e:#}");
            }

            samples.push(PriceSample {
                dex_id,
                dex,
                price: sampled,
                pair: pair_ref,
            });
        }

        Ok(samples)
    }

    /// Divergence detection: cheapest venue becomes the buy side, priciest
    /// the sell side. Returns None below the pair's configured threshold.
    pub async fn find_arbitrage_opportunity(
        &self,
        pair: &TokenPair,
    ) -> Result<Option<Opportunity>> {
        let samples = self.check_prices(pair).await?;
        if samples.len() < 2 {
            log::info!(
                "Need at least 2 price samples for {}, got {}",
                pair.symbol(),
                samples.len()
            );
            return Ok(None);
        }

        let mut min = &samples[0];
        let mut max = &samples[0];
        for sample in &samples[1..] {
            if sample.price < min.price {
                min = sample;
            }
            if sample.price > max.price {
                max = sample;
            }
        }

        let difference = (max.price - min.price)
            .checked_div(min.price)
            .context("minimum price is zero")?
            * Decimal::ONE_HUNDRED;
        log::info!("Price difference: {difference:.2}%");

        if difference <= pair.min_price_difference {
            log::info!(
                "Price difference below minimum threshold of {}%",
                pair.min_price_difference
            );
            return Ok(None);
        }

        log::info!(
            "Potential arbitrage direction: buy on {} ({:.6}), sell on {} ({:.6})",
            min.dex.name,
            min.price,
            max.dex.name,
            max.price
        );

        Ok(Some(Opportunity {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            blockchain_id: pair.blockchain_id,
            token_pair_id: pair.id,
            buy_dex: min.dex.clone(),
            sell_dex: max.dex.clone(),
            buy_pair: min.pair.clone(),
            sell_pair: max.pair.clone(),
            price_difference_pct: difference,
            // Refined once profitability is simulated.
            estimated_profit_pct: difference,
            amount_in: None,
            net_profit: None,
            gas_cost: None,
        }))
    }

    /// Refines the opportunity with slippage-aware quotes and gas, mutating
    /// it in place. Quoting failures read as "not profitable", never as an
    /// error: a reverting router must not produce a false positive.
    pub async fn check_profitability(
        &self,
        pair: &TokenPair,
        opportunity: &mut Opportunity,
    ) -> Result<bool> {
        log::info!("Determining profitability...");

        match self.refine_profitability(pair, opportunity).await {
            Ok(is_profitable) => Ok(is_profitable),
            Err(e) => {
                log::warn!(
                    "Error calculating profitability for {}: {e:#} \
                     (typically liquidity or price impact)",
                    pair.symbol()
                );
                Ok(false)
            }
        }
    }

    async fn refine_profitability(
        &self,
        pair: &TokenPair,
        opportunity: &mut Opportunity,
    ) -> Result<bool> {
        let token0 = pair.token0()?;
        let token1 = pair.token1()?;
        let buy_router = opportunity.buy_dex.router()?;
        let sell_router = opportunity.sell_dex.router()?;

        let (buy_reserve0, _) = self
            .chain
            .pair_reserves(pair.blockchain_id, opportunity.buy_pair.address)
            .await?;
        let (sell_reserve0, _) = self
            .chain
            .pair_reserves(pair.blockchain_id, opportunity.sell_pair.address)
            .await?;

        // 1% of the smaller pool's base reserve bounds the price impact.
        let trial_amount = buy_reserve0.min(sell_reserve0) / U256::from(100u64);
        if trial_amount.is_zero() {
            bail!("pool reserves too small to size a trade");
        }

        // token0 needed on the buy side to take trial_amount of token1 out.
        let buy_quote = self
            .chain
            .amounts_in(pair.blockchain_id, buy_router, trial_amount, vec![token0, token1])
            .await?;
        let token0_in = *buy_quote.first().context("empty quote from buy router")?;
        let token1_mid = *buy_quote.last().context("empty quote from buy router")?;

        // token0 recovered by selling that token1 on the sell side.
        let sell_quote = self
            .chain
            .amounts_out(pair.blockchain_id, sell_router, token1_mid, vec![token1, token0])
            .await?;
        let token0_back = *sell_quote.last().context("empty quote from sell router")?;

        let decimals = pair.token0_decimals as u32;
        log::info!(
            "Estimated {} {} to buy {} on {}, {} back after selling on {}",
            price::decimal_from_units(token0_in, decimals)?,
            pair.token0_symbol,
            pair.token1_symbol,
            opportunity.buy_dex.name,
            price::decimal_from_units(token0_back, decimals)?,
            opportunity.sell_dex.name
        );

        let profile = simulator::simulate(
            self.chain.as_ref(),
            pair.blockchain_id,
            token0_in,
            [buy_router, sell_router],
            token0,
            token1,
            decimals,
        )
        .await?;
        let gross_profit = profile.amount_out - profile.amount_in;

        let gas_price = self.chain.gas_price(pair.blockchain_id).await?;
        let gas_cost_wei = U256::from(self.settings.default_gas_limit) * gas_price;
        let gas_cost = price::decimal_from_units(gas_cost_wei, NATIVE_DECIMALS)?;

        let profit_native = gross_profit * NATIVE_PER_TOKEN0;
        let net_profit = profit_native - gas_cost;
        let net_profit_pct = net_profit
            .checked_div(profile.amount_in * NATIVE_PER_TOKEN0)
            .context("zero simulated trade size")?
            * Decimal::ONE_HUNDRED;
        let gross_profit_pct = gross_profit
            .checked_div(profile.amount_in)
            .context("zero simulated trade size")?
            * Decimal::ONE_HUNDRED;

        log::info!("Token amount in: {:.6}, out: {:.6}", profile.amount_in, profile.amount_out);
        log::info!("Gross profit: {gross_profit:.6} ({gross_profit_pct:.2}%)");
        log::info!("Gas cost: {gas_cost:.6}, net profit: {net_profit:.6} ({net_profit_pct:.2}%)");

        opportunity.estimated_profit_pct = net_profit_pct;
        opportunity.amount_in = Some(token0_in);
        opportunity.net_profit = Some(net_profit);
        opportunity.gas_cost = Some(gas_cost);

        let is_profitable = net_profit_pct > self.settings.min_profit_threshold;
        if is_profitable {
            log::info!("Trade is profitable with {net_profit_pct:.2}% net profit");
        } else {
            log::info!(
                "Trade is not profitable. Minimum profit threshold is {}%",
                self.settings.min_profit_threshold
            );
        }
        Ok(is_profitable)
    }

    async fn execute_trade(&self, pair: &TokenPair, opportunity: &Opportunity) -> Result<()> {
        log::info!("Attempting arbitrage...");

        let amount_in = opportunity
            .amount_in
            .context("opportunity is missing a refined trade size")?;

        let contracts = self
            .db
            .get_arbitrage_contracts(pair.blockchain_id, true)
            .await?;
        let Some(contract) = contracts.into_iter().next() else {
            log::warn!(
                "No active arbitrage contract found for blockchain {}",
                pair.blockchain_id
            );
            return Ok(());
        };

        let request = TradeRequest {
            blockchain_id: pair.blockchain_id,
            token_pair_id: pair.id,
            contract_address: contract.contract_address()?,
            start_on_first_dex: opportunity.buy_dex.id == self.settings.primary_dex_id,
            token0: pair.token0()?,
            token1: pair.token1()?,
            amount_in,
            gas_limit: self.settings.default_gas_limit,
            token0_decimals: pair.token0_decimals as u32,
        };
        let amount_in_dec = price::decimal_from_units(amount_in, request.token0_decimals)?;

        match self.executor.execute(&request).await {
            Ok(outcome) => {
                log::info!(
                    "Trade completed: {} (profit {:.6} {})",
                    outcome.tx_hash,
                    outcome.profit,
                    pair.token0_symbol
                );
                self.db
                    .log_arbitrage_transaction(&TradeRecord {
                        blockchain_id: pair.blockchain_id,
                        token_pair_id: pair.id,
                        buy_dex_id: opportunity.buy_dex.id,
                        sell_dex_id: opportunity.sell_dex.id,
                        tx_hash: Some(outcome.tx_hash),
                        amount_in: amount_in_dec,
                        amount_out: outcome.amount_out,
                        profit: outcome.profit,
                        gas_used: outcome.gas_used,
                        gas_price: outcome.gas_price,
                        status: TradeStatus::Completed,
                    })
                    .await?;
            }
            Err(e) => {
                log::error!("Error executing arbitrage for {}: {e:#}", pair.symbol());
                let record = TradeRecord {
                    blockchain_id: pair.blockchain_id,
                    token_pair_id: pair.id,
                    buy_dex_id: opportunity.buy_dex.id,
                    sell_dex_id: opportunity.sell_dex.id,
                    tx_hash: None,
                    amount_in: amount_in_dec,
                    amount_out: Decimal::ZERO,
                    profit: Decimal::ZERO,
                    gas_used: Decimal::ZERO,
                    gas_price: Decimal::ZERO,
                    status: TradeStatus::Failed,
                };
                if let Err(log_err) = self.db.log_arbitrage_transaction(&record).await {
                    log::error!("Failed to record failed trade: {log_err:#}");
                }
            }
        }
        Ok(())
    }

    fn record_opportunity(&self, opportunity: Opportunity) {
        let mut recent = self.opportunities.lock();
        recent.push_back(opportunity);
        while recent.len() > OPPORTUNITY_LOG_CAPACITY {
            recent.pop_front();
        }
    }
}
