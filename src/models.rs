use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value.trim()).with_context(|| format!("invalid address {value}"))
}

/// A configured blockchain network. RPC/WS URLs may embed `${VAR}` environment
/// placeholders that are substituted at connection time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Blockchain {
    pub id: i64,
    pub name: String,
    pub chain_id: i64,
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub explorer_url: Option<String>,
    pub native_token: String,
    pub gas_multiplier: Decimal,
    pub is_active: bool,
}

/// A constant-product DEX: router for quoting/swapping, factory for pool lookup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dex {
    pub id: i64,
    pub blockchain_id: i64,
    pub name: String,
    pub router_address: String,
    pub factory_address: String,
    pub version: String,
    pub is_active: bool,
}

impl Dex {
    pub fn router(&self) -> Result<Address> {
        parse_address(&self.router_address)
    }

    pub fn factory(&self) -> Result<Address> {
        parse_address(&self.factory_address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Token {
    pub id: i64,
    pub blockchain_id: i64,
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i32,
    pub is_active: bool,
}

/// A monitored token pair, joined with both tokens' addresses, symbols and
/// decimals. Re-fetched on every evaluation so edits take effect on the next
/// swap event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenPair {
    pub id: i64,
    pub blockchain_id: i64,
    pub token0_id: i64,
    pub token1_id: i64,
    pub min_price_difference: Decimal,
    pub is_active: bool,
    pub token0_address: String,
    pub token0_symbol: String,
    pub token0_decimals: i32,
    pub token1_address: String,
    pub token1_symbol: String,
    pub token1_decimals: i32,
}

impl TokenPair {
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.token0_symbol, self.token1_symbol)
    }

    pub fn token0(&self) -> Result<Address> {
        parse_address(&self.token0_address)
    }

    pub fn token1(&self) -> Result<Address> {
        parse_address(&self.token1_address)
    }
}

/// An on-chain flash-loan arbitrage contract available for trade execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArbitrageContract {
    pub id: i64,
    pub blockchain_id: i64,
    pub address: String,
    pub flash_loan_provider: String,
    pub is_active: bool,
}

impl ArbitrageContract {
    pub fn contract_address(&self) -> Result<Address> {
        parse_address(&self.address)
    }
}

/// Resolved handle to one DEX's pool for a token pair. Cheap to clone; the
/// registry turns it back into a typed contract binding on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairRef {
    pub blockchain_id: i64,
    pub dex_id: i64,
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub token0_decimals: u32,
    pub token1_decimals: u32,
}

/// One DEX's price reading for a pair at one point in time.
#[derive(Debug, Clone)]
pub struct PriceSample {
    pub dex_id: i64,
    pub dex: Dex,
    pub price: Decimal,
    pub pair: PairRef,
}

/// A detected cross-DEX divergence, refined in place as profitability is
/// estimated. `amount_in`, `net_profit` and `gas_cost` are filled by the
/// profitability check.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub blockchain_id: i64,
    pub token_pair_id: i64,
    pub buy_dex: Dex,
    pub sell_dex: Dex,
    pub buy_pair: PairRef,
    pub sell_pair: PairRef,
    pub price_difference_pct: Decimal,
    pub estimated_profit_pct: Decimal,
    pub amount_in: Option<U256>,
    pub net_profit: Option<Decimal>,
    pub gas_cost: Option<Decimal>,
}

/// Notification that a swap happened on a monitored pool.
#[derive(Debug, Clone, Copy)]
pub struct SwapEvent {
    pub blockchain_id: i64,
    pub token_pair_id: i64,
    pub dex_id: i64,
}

#[derive(Debug, Clone)]
pub struct PriceRecord {
    pub blockchain_id: i64,
    pub token_pair_id: i64,
    pub dex_id: i64,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Completed,
    Failed,
    Pending,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Completed => "completed",
            TradeStatus::Failed => "failed",
            TradeStatus::Pending => "pending",
        }
    }
}

/// Outcome of an execution attempt, as written to trade history.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub blockchain_id: i64,
    pub token_pair_id: i64,
    pub buy_dex_id: i64,
    pub sell_dex_id: i64,
    pub tx_hash: Option<String>,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub profit: Decimal,
    pub gas_used: Decimal,
    pub gas_price: Decimal,
    pub status: TradeStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTokenPair {
    pub blockchain_id: i64,
    pub token0_id: i64,
    pub token1_id: i64,
    pub min_price_difference: Decimal,
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDex {
    pub blockchain_id: i64,
    pub name: String,
    pub router_address: String,
    pub factory_address: String,
    pub version: String,
    pub is_active: bool,
}
