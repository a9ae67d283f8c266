use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::models::{
    ArbitrageContract, Blockchain, Dex, NewDex, NewTokenPair, PriceRecord, TokenPair, TradeRecord,
};

/// Read access to the monitoring configuration plus write access to price
/// and trade history. The engine and supervisor only see this trait.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_blockchains(&self, active_only: bool) -> Result<Vec<Blockchain>>;
    async fn get_blockchain(&self, id: i64) -> Result<Option<Blockchain>>;
    async fn get_dexes(&self, blockchain_id: i64, active_only: bool) -> Result<Vec<Dex>>;
    async fn get_dex(&self, id: i64) -> Result<Option<Dex>>;
    async fn get_token_pairs(
        &self,
        blockchain_id: Option<i64>,
        active_only: bool,
    ) -> Result<Vec<TokenPair>>;
    async fn get_token_pair(&self, blockchain_id: i64, id: i64) -> Result<Option<TokenPair>>;
    async fn get_arbitrage_contracts(
        &self,
        blockchain_id: i64,
        active_only: bool,
    ) -> Result<Vec<ArbitrageContract>>;
    async fn insert_token_pair(&self, pair: &NewTokenPair) -> Result<i64>;
    async fn insert_dex(&self, dex: &NewDex) -> Result<i64>;
    async fn log_price(&self, record: &PriceRecord) -> Result<()>;
    async fn log_arbitrage_transaction(&self, record: &TradeRecord) -> Result<()>;
}

const TOKEN_PAIR_SELECT: &str = r#"
    SELECT tp.id, tp.blockchain_id, tp.token0_id, tp.token1_id,
           tp.min_price_difference, tp.is_active,
           t0.address AS token0_address, t0.symbol AS token0_symbol, t0.decimals AS token0_decimals,
           t1.address AS token1_address, t1.symbol AS token1_symbol, t1.decimals AS token1_decimals
    FROM token_pairs tp
    JOIN tokens t0 ON tp.token0_id = t0.id
    JOIN tokens t1 ON tp.token1_id = t1.id
"#;

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blockchains (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR NOT NULL,
                chain_id BIGINT NOT NULL,
                rpc_url VARCHAR NOT NULL,
                ws_url VARCHAR,
                explorer_url VARCHAR,
                native_token VARCHAR NOT NULL,
                gas_multiplier DECIMAL NOT NULL DEFAULT 1.1,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            );

            CREATE TABLE IF NOT EXISTS dexes (
                id BIGSERIAL PRIMARY KEY,
                blockchain_id BIGINT NOT NULL REFERENCES blockchains (id),
                name VARCHAR NOT NULL,
                router_address VARCHAR NOT NULL,
                factory_address VARCHAR NOT NULL,
                version VARCHAR NOT NULL DEFAULT 'v2',
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id BIGSERIAL PRIMARY KEY,
                blockchain_id BIGINT NOT NULL REFERENCES blockchains (id),
                address VARCHAR NOT NULL,
                symbol VARCHAR NOT NULL,
                name VARCHAR NOT NULL,
                decimals INT NOT NULL DEFAULT 18,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            );

            CREATE TABLE IF NOT EXISTS token_pairs (
                id BIGSERIAL PRIMARY KEY,
                blockchain_id BIGINT NOT NULL REFERENCES blockchains (id),
                token0_id BIGINT NOT NULL REFERENCES tokens (id),
                token1_id BIGINT NOT NULL REFERENCES tokens (id),
                min_price_difference DECIMAL NOT NULL DEFAULT 0.5,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            );

            CREATE TABLE IF NOT EXISTS arbitrage_contracts (
                id BIGSERIAL PRIMARY KEY,
                blockchain_id BIGINT NOT NULL REFERENCES blockchains (id),
                address VARCHAR NOT NULL,
                flash_loan_provider VARCHAR NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            );

            CREATE TABLE IF NOT EXISTS price_history (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                blockchain_id BIGINT NOT NULL,
                token_pair_id BIGINT NOT NULL,
                dex_id BIGINT NOT NULL,
                price DECIMAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_price_history_pair
            ON price_history (token_pair_id, timestamp);

            CREATE TABLE IF NOT EXISTS arbitrage_transactions (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                blockchain_id BIGINT NOT NULL,
                token_pair_id BIGINT NOT NULL,
                buy_dex_id BIGINT NOT NULL,
                sell_dex_id BIGINT NOT NULL,
                tx_hash VARCHAR,
                amount_in DECIMAL NOT NULL,
                amount_out DECIMAL NOT NULL,
                profit DECIMAL NOT NULL,
                gas_used DECIMAL NOT NULL,
                gas_price DECIMAL NOT NULL,
                status VARCHAR NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_arbitrage_transactions_timestamp
            ON arbitrage_transactions (timestamp);

            CREATE TABLE IF NOT EXISTS config (
                name VARCHAR PRIMARY KEY,
                value VARCHAR NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Persistence for Database {
    async fn get_blockchains(&self, active_only: bool) -> Result<Vec<Blockchain>> {
        let blockchains = sqlx::query_as::<_, Blockchain>(
            "SELECT * FROM blockchains WHERE is_active OR NOT $1 ORDER BY id",
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(blockchains)
    }

    async fn get_blockchain(&self, id: i64) -> Result<Option<Blockchain>> {
        let blockchain =
            sqlx::query_as::<_, Blockchain>("SELECT * FROM blockchains WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blockchain)
    }

    async fn get_dexes(&self, blockchain_id: i64, active_only: bool) -> Result<Vec<Dex>> {
        let dexes = sqlx::query_as::<_, Dex>(
            "SELECT * FROM dexes WHERE blockchain_id = $1 AND (is_active OR NOT $2) ORDER BY id",
        )
        .bind(blockchain_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(dexes)
    }

    async fn get_dex(&self, id: i64) -> Result<Option<Dex>> {
        let dex = sqlx::query_as::<_, Dex>("SELECT * FROM dexes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dex)
    }

    async fn get_token_pairs(
        &self,
        blockchain_id: Option<i64>,
        active_only: bool,
    ) -> Result<Vec<TokenPair>> {
        let query = format!(
            "{TOKEN_PAIR_SELECT} WHERE ($1::BIGINT IS NULL OR tp.blockchain_id = $1) \
             AND (tp.is_active OR NOT $2) ORDER BY tp.id"
        );
        let pairs = sqlx::query_as::<_, TokenPair>(&query)
            .bind(blockchain_id)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;
        Ok(pairs)
    }

    async fn get_token_pair(&self, blockchain_id: i64, id: i64) -> Result<Option<TokenPair>> {
        let query = format!("{TOKEN_PAIR_SELECT} WHERE tp.blockchain_id = $1 AND tp.id = $2");
        let pair = sqlx::query_as::<_, TokenPair>(&query)
            .bind(blockchain_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(pair)
    }

    async fn get_arbitrage_contracts(
        &self,
        blockchain_id: i64,
        active_only: bool,
    ) -> Result<Vec<ArbitrageContract>> {
        let contracts = sqlx::query_as::<_, ArbitrageContract>(
            "SELECT * FROM arbitrage_contracts \
             WHERE blockchain_id = $1 AND (is_active OR NOT $2) ORDER BY id",
        )
        .bind(blockchain_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(contracts)
    }

    async fn insert_token_pair(&self, pair: &NewTokenPair) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO token_pairs (blockchain_id, token0_id, token1_id, min_price_difference, is_active) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(pair.blockchain_id)
        .bind(pair.token0_id)
        .bind(pair.token1_id)
        .bind(pair.min_price_difference)
        .bind(pair.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn insert_dex(&self, dex: &NewDex) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO dexes (blockchain_id, name, router_address, factory_address, version, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(dex.blockchain_id)
        .bind(&dex.name)
        .bind(&dex.router_address)
        .bind(&dex.factory_address)
        .bind(&dex.version)
        .bind(dex.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn log_price(&self, record: &PriceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO price_history (id, timestamp, blockchain_id, token_pair_id, dex_id, price) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .bind(record.blockchain_id)
        .bind(record.token_pair_id)
        .bind(record.dex_id)
        .bind(record.price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_arbitrage_transaction(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO arbitrage_transactions (id, timestamp, blockchain_id, token_pair_id, \
             buy_dex_id, sell_dex_id, tx_hash, amount_in, amount_out, profit, gas_used, gas_price, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .bind(record.blockchain_id)
        .bind(record.token_pair_id)
        .bind(record.buy_dex_id)
        .bind(record.sell_dex_id)
        .bind(&record.tx_hash)
        .bind(record.amount_in)
        .bind(record.amount_out)
        .bind(record.profit)
        .bind(record.gas_used)
        .bind(record.gas_price)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for Database {
    async fn get_config(&self, name: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_config(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (name, value) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
