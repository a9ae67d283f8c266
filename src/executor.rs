use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;

use crate::price::decimal_from_units;
use crate::registry::{ChainProvider, ChainRegistry, FlashArbitrage, IERC20};

/// Everything the on-chain arbitrage contract needs for one trade.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub blockchain_id: i64,
    pub token_pair_id: i64,
    pub contract_address: Address,
    /// Whether the contract should route through its first configured router
    /// first; derived from the buy-side DEX and the primary_dex_id policy.
    pub start_on_first_dex: bool,
    pub token0: Address,
    pub token1: Address,
    pub amount_in: U256,
    pub gas_limit: u64,
    pub token0_decimals: u32,
}

#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub tx_hash: String,
    pub amount_out: Decimal,
    pub profit: Decimal,
    pub gas_used: Decimal,
    pub gas_price: Decimal,
}

/// Submits an arbitrage trade and reports how it went. The flash-loan
/// mechanics live in the on-chain contract; this side only dispatches and
/// interprets the receipt.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    async fn execute(&self, request: &TradeRequest) -> Result<TradeOutcome>;
}

/// Dispatches trades through the deployed flash-loan arbitrage contract,
/// signing with the operator's key.
pub struct FlashArbitrageExecutor {
    registry: Arc<ChainRegistry>,
    private_key: String,
}

impl FlashArbitrageExecutor {
    pub fn new(registry: Arc<ChainRegistry>, private_key: String) -> Self {
        Self {
            registry,
            private_key,
        }
    }
}

#[async_trait]
impl TradeExecutor for FlashArbitrageExecutor {
    async fn execute(&self, request: &TradeRequest) -> Result<TradeOutcome> {
        let wallet = self.registry.signer(request.blockchain_id, &self.private_key)?;
        match self.registry.provider(request.blockchain_id)? {
            ChainProvider::Ws(p) => execute_via(p, wallet, request).await,
            ChainProvider::Http(p) => execute_via(p, wallet, request).await,
        }
    }
}

/// Configured when no private key is available; trades fail at dispatch time
/// and get recorded as failed, monitoring itself is unaffected.
pub struct UnconfiguredExecutor;

#[async_trait]
impl TradeExecutor for UnconfiguredExecutor {
    async fn execute(&self, _request: &TradeRequest) -> Result<TradeOutcome> {
        bail!("private key not configured")
    }
}

async fn execute_via<M: Middleware + Clone + 'static>(
    provider: Arc<M>,
    wallet: LocalWallet,
    request: &TradeRequest,
) -> Result<TradeOutcome> {
    let operator = wallet.address();
    let client = Arc::new(SignerMiddleware::new((*provider).clone(), wallet));

    let token0 = IERC20::new(request.token0, provider.clone());
    let balance_before: U256 = token0
        .balance_of(operator)
        .call()
        .await
        .context("failed to read token0 balance")?;

    let contract = FlashArbitrage::new(request.contract_address, client);
    let call = contract
        .execute_trade(
            request.start_on_first_dex,
            request.token0,
            request.token1,
            request.amount_in,
        )
        .gas(request.gas_limit);

    let pending = call.send().await.context("arbitrage transaction rejected")?;
    let tx_hash = format!("{:#x}", *pending);
    log::info!("Transaction sent: {tx_hash}, waiting for confirmation...");

    let receipt = pending
        .await
        .context("error awaiting transaction")?
        .context("transaction was dropped from the mempool")?;
    ensure!(
        receipt.status == Some(1u64.into()),
        "transaction reverted: {tx_hash}"
    );

    let balance_after: U256 = token0
        .balance_of(operator)
        .call()
        .await
        .context("failed to read token0 balance")?;

    let amount_out = decimal_from_units(balance_after, request.token0_decimals)?;
    let profit = amount_out - decimal_from_units(balance_before, request.token0_decimals)?;
    let gas_used = decimal_from_units(receipt.gas_used.unwrap_or_default(), 0)?;
    let gas_price = decimal_from_units(receipt.effective_gas_price.unwrap_or_default(), 0)?;

    Ok(TradeOutcome {
        tx_hash,
        amount_out,
        profit,
        gas_used,
        gas_price,
    })
}
