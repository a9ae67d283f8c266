use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;

use crate::price::decimal_from_units;
use crate::registry::ChainClient;

/// Slippage-aware round trip: what goes in on the buy side and what comes
/// back out on the sell side, in token0 units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeProfile {
    pub amount_in: Decimal,
    pub amount_out: Decimal,
}

/// Routes `amount_in` of token0 through the buy router (token0 -> token1) and
/// sells the proceeds back through the sell router (token1 -> token0). Each
/// router's own quoting function is authoritative for its pool's curve, so
/// the figures include the price impact of the trade size itself.
pub async fn simulate(
    chain: &dyn ChainClient,
    blockchain_id: i64,
    amount_in: U256,
    routers: [Address; 2],
    token0: Address,
    token1: Address,
    token0_decimals: u32,
) -> Result<TradeProfile> {
    let [buy_router, sell_router] = routers;

    let forward = chain
        .amounts_out(blockchain_id, buy_router, amount_in, vec![token0, token1])
        .await?;
    let intermediate = *forward.last().context("empty quote from buy router")?;

    let backward = chain
        .amounts_out(blockchain_id, sell_router, intermediate, vec![token1, token0])
        .await?;
    let amount_out = *backward.last().context("empty quote from sell router")?;

    Ok(TradeProfile {
        amount_in: decimal_from_units(amount_in, token0_decimals)?,
        amount_out: decimal_from_units(amount_out, token0_decimals)?,
    })
}
