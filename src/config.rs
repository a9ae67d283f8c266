use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub private_key: Option<String>,
    pub rpc_call_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            private_key: env::var("PRIVATE_KEY").ok(),
            rpc_call_timeout_secs: env::var("RPC_CALL_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid RPC_CALL_TIMEOUT_SECS")?,
        })
    }
}

/// Runtime configuration keys, editable from the dashboard while the bot runs.
pub mod keys {
    pub const GAS_LIMIT_MULTIPLIER: &str = "gas_limit_multiplier";
    pub const MIN_PROFIT_THRESHOLD: &str = "min_profit_threshold";
    pub const EXECUTION_ENABLED: &str = "execution_enabled";
    pub const DEFAULT_GAS_LIMIT: &str = "default_gas_limit";
    pub const PRIMARY_DEX_ID: &str = "primary_dex_id";
}

/// Key/value configuration store, backed by the database in production.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, name: &str) -> Result<Option<String>>;
    async fn set_config(&self, name: &str, value: &str) -> Result<()>;
}

/// Settings the engine reads at startup from the [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub gas_limit_multiplier: Decimal,
    pub min_profit_threshold: Decimal,
    pub default_gas_limit: u64,
    /// Which DEX id the arbitrage contract treats as its first router; the
    /// trade direction flag is derived from it.
    pub primary_dex_id: i64,
    pub execution_enabled: bool,
}

impl BotSettings {
    pub async fn load(store: &dyn ConfigStore) -> Result<Self> {
        Ok(BotSettings {
            gas_limit_multiplier: lookup(store, keys::GAS_LIMIT_MULTIPLIER, "1.1").await?,
            min_profit_threshold: lookup(store, keys::MIN_PROFIT_THRESHOLD, "0.1").await?,
            default_gas_limit: lookup(store, keys::DEFAULT_GAS_LIMIT, "400000").await?,
            primary_dex_id: lookup(store, keys::PRIMARY_DEX_ID, "1").await?,
            execution_enabled: lookup::<String>(store, keys::EXECUTION_ENABLED, "false").await? == "true",
        })
    }
}

async fn lookup<T>(store: &dyn ConfigStore, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = store
        .get_config(key)
        .await?
        .unwrap_or_else(|| default.to_string());
    raw.parse()
        .with_context(|| format!("invalid value {raw:?} for config key {key}"))
}
