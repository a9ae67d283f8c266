//! Multi-chain DEX arbitrage monitor: watches swap events across the DEXes
//! of each configured blockchain, detects cross-exchange price divergence for
//! monitored token pairs, estimates profitability net of gas, and optionally
//! executes flash-loan-funded trades through an on-chain contract.

pub mod config;
pub mod database;
pub mod engine;
pub mod executor;
pub mod models;
pub mod monitor;
pub mod price;
pub mod registry;
pub mod simulator;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{BotSettings, Config, ConfigStore};
pub use database::{Database, Persistence};
pub use engine::{EvaluationOutcome, OpportunityEngine};
pub use executor::{FlashArbitrageExecutor, TradeExecutor, UnconfiguredExecutor};
pub use monitor::{MonitorSupervisor, MonitorTable};
pub use registry::{ChainClient, ChainRegistry, RegistryError};
