use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::contract::abigen;
use ethers::providers::{Http, Middleware, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

use crate::models::{Blockchain, SwapEvent};

abigen!(
    IUniswapV2Pair,
    r#"[
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)
        event Swap(address indexed sender, uint256 amount0In, uint256 amount1In, uint256 amount0Out, uint256 amount1Out, address indexed to)
    ]"#
);

abigen!(
    IUniswapV2Router02,
    r#"[
        function getAmountsOut(uint256 amountIn, address[] calldata path) external view returns (uint256[] memory amounts)
        function getAmountsIn(uint256 amountOut, address[] calldata path) external view returns (uint256[] memory amounts)
    ]"#
);

abigen!(
    IUniswapV2Factory,
    r#"[function getPair(address tokenA, address tokenB) external view returns (address pair)]"#
);

abigen!(
    IERC20,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function decimals() external view returns (uint8)
    ]"#
);

abigen!(
    FlashArbitrage,
    r#"[function executeTrade(bool startOnFirstDex, address token0, address token1, uint256 flashAmount) external]"#
);

pub type ListenerKey = String;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("blockchain {0} has no connected provider")]
    UnknownBlockchain(i64),
    #[error("failed to connect provider for {name}: {message}")]
    Connect { name: String, message: String },
    #[error("no pool for {token0:?}/{token1:?} on dex {dex_id}")]
    PairNotFound {
        dex_id: i64,
        token0: Address,
        token1: Address,
    },
    #[error("chain call timed out after {0:?}")]
    Timeout(Duration),
    #[error("chain call failed: {0}")]
    Call(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

/// Everything the engine, sampler, simulator and supervisor need from a
/// chain. Implemented by [`ChainRegistry`] in production and by an in-memory
/// stub in tests.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Resolves (and caches) the pool address for a token pair on one DEX.
    async fn pair_address(
        &self,
        blockchain_id: i64,
        dex_id: i64,
        factory: Address,
        token0: Address,
        token1: Address,
    ) -> Result<Address, RegistryError>;

    async fn pair_reserves(
        &self,
        blockchain_id: i64,
        pair: Address,
    ) -> Result<(U256, U256), RegistryError>;

    async fn amounts_out(
        &self,
        blockchain_id: i64,
        router: Address,
        amount_in: U256,
        path: Vec<Address>,
    ) -> Result<Vec<U256>, RegistryError>;

    async fn amounts_in(
        &self,
        blockchain_id: i64,
        router: Address,
        amount_out: U256,
        path: Vec<Address>,
    ) -> Result<Vec<U256>, RegistryError>;

    async fn gas_price(&self, blockchain_id: i64) -> Result<U256, RegistryError>;

    async fn block_number(&self, blockchain_id: i64) -> Result<u64, RegistryError>;

    /// Streams the pool's Swap events into `events`. Registering the same
    /// (blockchain, pool, dex, pair) combination again replaces the previous
    /// listener instead of stacking a second one.
    async fn monitor_swap_events(
        &self,
        blockchain_id: i64,
        pair: Address,
        token_pair_id: i64,
        dex_id: i64,
        events: mpsc::Sender<SwapEvent>,
    ) -> Result<ListenerKey, RegistryError>;

    fn remove_swap_listener(&self, key: &str);

    /// Detaches every listener and drops all providers. Idempotent.
    fn close_all(&self);
}

/// One ethers provider per blockchain, WebSocket preferred for event
/// delivery. Contract handles are resolved against the cached provider and
/// pool addresses are cached after the first factory lookup.
#[derive(Clone)]
pub enum ChainProvider {
    Ws(Arc<Provider<Ws>>),
    Http(Arc<Provider<Http>>),
}

pub struct ChainRegistry {
    providers: DashMap<i64, ChainProvider>,
    chains: DashMap<i64, Blockchain>,
    pair_addresses: DashMap<(i64, i64, Address, Address), Address>,
    listeners: DashMap<ListenerKey, JoinHandle<()>>,
    rpc_timeout: Duration,
}

impl ChainRegistry {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            chains: DashMap::new(),
            pair_addresses: DashMap::new(),
            listeners: DashMap::new(),
            rpc_timeout,
        }
    }

    /// Establishes the provider for one blockchain, with retry/backoff.
    /// Startup treats a failure here as fatal.
    pub async fn connect(&self, blockchain: &Blockchain) -> Result<(), RegistryError> {
        let strategy = ExponentialBackoff::from_millis(250).map(jitter).take(3);
        let provider = Retry::spawn(strategy, || Self::open_provider(blockchain)).await?;

        self.providers.insert(blockchain.id, provider);
        self.chains.insert(blockchain.id, blockchain.clone());
        log::info!(
            "Initialized provider for {} (Chain ID: {})",
            blockchain.name,
            blockchain.chain_id
        );
        Ok(())
    }

    async fn open_provider(blockchain: &Blockchain) -> Result<ChainProvider, RegistryError> {
        let connect_err = |message: String| RegistryError::Connect {
            name: blockchain.name.clone(),
            message,
        };

        if let Some(ws_url) = &blockchain.ws_url {
            let url = substitute_env_vars(ws_url);
            let ws = Ws::connect(url).await.map_err(|e| connect_err(e.to_string()))?;
            Ok(ChainProvider::Ws(Arc::new(Provider::new(ws))))
        } else {
            let url = substitute_env_vars(&blockchain.rpc_url);
            let provider = Provider::<Http>::try_from(url.as_str())
                .map_err(|e| connect_err(e.to_string()))?;
            Ok(ChainProvider::Http(Arc::new(provider)))
        }
    }

    pub fn provider(&self, blockchain_id: i64) -> Result<ChainProvider, RegistryError> {
        self.providers
            .get(&blockchain_id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::UnknownBlockchain(blockchain_id))
    }

    pub fn chain(&self, blockchain_id: i64) -> Option<Blockchain> {
        self.chains.get(&blockchain_id).map(|entry| entry.value().clone())
    }

    /// Wallet bound to the blockchain's chain id, for transaction signing.
    pub fn signer(
        &self,
        blockchain_id: i64,
        private_key: &str,
    ) -> Result<LocalWallet, RegistryError> {
        let chain = self
            .chain(blockchain_id)
            .ok_or(RegistryError::UnknownBlockchain(blockchain_id))?;
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| RegistryError::InvalidKey(e.to_string()))?;
        Ok(wallet.with_chain_id(chain.chain_id as u64))
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RegistryError>>,
    ) -> Result<T, RegistryError> {
        timeout(self.rpc_timeout, call)
            .await
            .map_err(|_| RegistryError::Timeout(self.rpc_timeout))?
    }
}

#[async_trait]
impl ChainClient for ChainRegistry {
    async fn pair_address(
        &self,
        blockchain_id: i64,
        dex_id: i64,
        factory: Address,
        token0: Address,
        token1: Address,
    ) -> Result<Address, RegistryError> {
        let key = (blockchain_id, dex_id, token0, token1);
        if let Some(cached) = self.pair_addresses.get(&key) {
            return Ok(*cached.value());
        }

        let address = match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => self.bounded(resolve_pair_via(p, factory, token0, token1)).await?,
            ChainProvider::Http(p) => self.bounded(resolve_pair_via(p, factory, token0, token1)).await?,
        };
        if address == Address::zero() {
            return Err(RegistryError::PairNotFound { dex_id, token0, token1 });
        }

        self.pair_addresses.insert(key, address);
        Ok(address)
    }

    async fn pair_reserves(
        &self,
        blockchain_id: i64,
        pair: Address,
    ) -> Result<(U256, U256), RegistryError> {
        match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => self.bounded(reserves_via(p, pair)).await,
            ChainProvider::Http(p) => self.bounded(reserves_via(p, pair)).await,
        }
    }

    async fn amounts_out(
        &self,
        blockchain_id: i64,
        router: Address,
        amount_in: U256,
        path: Vec<Address>,
    ) -> Result<Vec<U256>, RegistryError> {
        match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => self.bounded(amounts_out_via(p, router, amount_in, path)).await,
            ChainProvider::Http(p) => self.bounded(amounts_out_via(p, router, amount_in, path)).await,
        }
    }

    async fn amounts_in(
        &self,
        blockchain_id: i64,
        router: Address,
        amount_out: U256,
        path: Vec<Address>,
    ) -> Result<Vec<U256>, RegistryError> {
        match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => self.bounded(amounts_in_via(p, router, amount_out, path)).await,
            ChainProvider::Http(p) => self.bounded(amounts_in_via(p, router, amount_out, path)).await,
        }
    }

    async fn gas_price(&self, blockchain_id: i64) -> Result<U256, RegistryError> {
        match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => self.bounded(gas_price_via(p)).await,
            ChainProvider::Http(p) => self.bounded(gas_price_via(p)).await,
        }
    }

    async fn block_number(&self, blockchain_id: i64) -> Result<u64, RegistryError> {
        match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => self.bounded(block_number_via(p)).await,
            ChainProvider::Http(p) => self.bounded(block_number_via(p)).await,
        }
    }

    async fn monitor_swap_events(
        &self,
        blockchain_id: i64,
        pair: Address,
        token_pair_id: i64,
        dex_id: i64,
        events: mpsc::Sender<SwapEvent>,
    ) -> Result<ListenerKey, RegistryError> {
        let key = format!("{blockchain_id}_{pair:#x}_{dex_id}_{token_pair_id}");
        self.remove_swap_listener(&key);

        let event = SwapEvent {
            blockchain_id,
            token_pair_id,
            dex_id,
        };
        let handle = match self.provider(blockchain_id)? {
            ChainProvider::Ws(p) => spawn_swap_listener(p, pair, event, events, key.clone()),
            ChainProvider::Http(p) => spawn_swap_listener(p, pair, event, events, key.clone()),
        };

        if let Some(replaced) = self.listeners.insert(key.clone(), handle) {
            replaced.abort();
        }
        log::debug!("Registered swap listener {key}");
        Ok(key)
    }

    fn remove_swap_listener(&self, key: &str) {
        if let Some((_, handle)) = self.listeners.remove(key) {
            handle.abort();
            log::debug!("Removed swap listener {key}");
        }
    }

    fn close_all(&self) {
        self.listeners.retain(|_, handle| {
            handle.abort();
            false
        });
        self.pair_addresses.clear();
        self.providers.clear();
        self.chains.clear();
        log::info!("All blockchain connections closed");
    }
}

async fn resolve_pair_via<M: Middleware + 'static>(
    provider: Arc<M>,
    factory: Address,
    token0: Address,
    token1: Address,
) -> Result<Address, RegistryError> {
    let factory = IUniswapV2Factory::new(factory, provider);
    factory
        .get_pair(token0, token1)
        .call()
        .await
        .map_err(|e| RegistryError::Call(e.to_string()))
}

async fn reserves_via<M: Middleware + 'static>(
    provider: Arc<M>,
    pair: Address,
) -> Result<(U256, U256), RegistryError> {
    let pair = IUniswapV2Pair::new(pair, provider);
    let (reserve0, reserve1, _): (u128, u128, u32) = pair
        .get_reserves()
        .call()
        .await
        .map_err(|e| RegistryError::Call(e.to_string()))?;
    Ok((U256::from(reserve0), U256::from(reserve1)))
}

async fn amounts_out_via<M: Middleware + 'static>(
    provider: Arc<M>,
    router: Address,
    amount_in: U256,
    path: Vec<Address>,
) -> Result<Vec<U256>, RegistryError> {
    let router = IUniswapV2Router02::new(router, provider);
    router
        .get_amounts_out(amount_in, path)
        .call()
        .await
        .map_err(|e| RegistryError::Call(e.to_string()))
}

async fn amounts_in_via<M: Middleware + 'static>(
    provider: Arc<M>,
    router: Address,
    amount_out: U256,
    path: Vec<Address>,
) -> Result<Vec<U256>, RegistryError> {
    let router = IUniswapV2Router02::new(router, provider);
    router
        .get_amounts_in(amount_out, path)
        .call()
        .await
        .map_err(|e| RegistryError::Call(e.to_string()))
}

async fn gas_price_via<M: Middleware + 'static>(provider: Arc<M>) -> Result<U256, RegistryError> {
    provider
        .get_gas_price()
        .await
        .map_err(|e| RegistryError::Call(e.to_string()))
}

async fn block_number_via<M: Middleware + 'static>(provider: Arc<M>) -> Result<u64, RegistryError> {
    provider
        .get_block_number()
        .await
        .map(|block| block.as_u64())
        .map_err(|e| RegistryError::Call(e.to_string()))
}

fn spawn_swap_listener<M: Middleware + 'static>(
    provider: Arc<M>,
    pair: Address,
    event: SwapEvent,
    events: mpsc::Sender<SwapEvent>,
    key: ListenerKey,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let contract = IUniswapV2Pair::new(pair, provider);
        let swaps = contract.swap_filter();
        let mut stream = match swaps.stream().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to open swap stream for {key}: {e}");
                return;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(swap) => {
                    log::debug!(
                        "Swap on {pair:#x}: {} in / {} out",
                        swap.amount_0_in,
                        swap.amount_0_out
                    );
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Swap stream error for {key}: {e}"),
            }
        }
        log::debug!("Swap stream for {key} ended");
    })
}

/// Replaces `${VAR}` placeholders in provider URLs with values from the
/// process environment; unknown variables are left in place.
fn substitute_env_vars(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
