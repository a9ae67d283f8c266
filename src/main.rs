use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use multichain_arb_bot::config::{Config, ConfigStore};
use multichain_arb_bot::database::{Database, Persistence};
use multichain_arb_bot::executor::{FlashArbitrageExecutor, TradeExecutor, UnconfiguredExecutor};
use multichain_arb_bot::monitor::{MonitorSupervisor, MonitorTable};
use multichain_arb_bot::registry::{ChainClient, ChainRegistry};
use multichain_arb_bot::OpportunityEngine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    log::info!("Starting Multi-Chain Arbitrage Bot...");

    let config = Config::from_env()?;
    let db = Arc::new(Database::new(&config.database_url).await?);
    db.init().await?;

    // A chain that cannot connect at startup is fatal: better to abort than
    // run half-initialized.
    let registry = Arc::new(ChainRegistry::new(Duration::from_secs(
        config.rpc_call_timeout_secs,
    )));
    let blockchains = db.get_blockchains(true).await?;
    if blockchains.is_empty() {
        log::warn!("No active blockchains configured");
    }
    for blockchain in &blockchains {
        registry
            .connect(blockchain)
            .await
            .with_context(|| format!("failed to initialize provider for {}", blockchain.name))?;
    }

    let executor: Arc<dyn TradeExecutor> = match &config.private_key {
        Some(private_key) => Arc::new(FlashArbitrageExecutor::new(
            Arc::clone(&registry),
            private_key.clone(),
        )),
        None => Arc::new(UnconfiguredExecutor),
    };

    let chain: Arc<dyn ChainClient> = registry;
    let persistence: Arc<dyn Persistence> = db.clone();
    let config_store: Arc<dyn ConfigStore> = db.clone();

    let monitors = Arc::new(MonitorTable::new());
    let engine = OpportunityEngine::new(
        Arc::clone(&chain),
        Arc::clone(&persistence),
        config_store,
        executor,
        Arc::clone(&monitors),
    )
    .await?;

    let supervisor = MonitorSupervisor::new(engine, chain, persistence, monitors);
    supervisor.start_monitoring().await?;
    log::info!("Bot is running and monitoring for arbitrage opportunities");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    log::info!("Received shutdown signal, shutting down...");
    supervisor.stop().await;

    Ok(())
}
