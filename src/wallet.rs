//! wallet.rs – Wallet session: provider connection, account/network state,
//! contract handles and raw transaction submission.
//!
//! Session state lives in a `watch` channel holding `Option<SessionInfo>`.
//! Every change is a whole-value replacement made under the channel's lock,
//! so readers never see an account without a network or the reverse.
//! Provider-pushed events arrive over an mpsc channel drained by one pump
//! task per session.
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::OpError;
use crate::models::{short_address, ChainId, SessionInfo, TxHash};

// ---------------------------------------------------------------------------
// Contract interfaces
// ---------------------------------------------------------------------------

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IStockToken {
        function approve(address spender, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IStockVault {
        struct StakeInfo {
            uint256 amount;
            uint256 borrowed;
            uint256 timestamp;
            bool active;
        }

        function stakeStock(address token, uint256 amount, uint256 scosAmount) external;
        function unstakeStock(address token) external;
        function getStakeInfo(address user, address token) external view returns (StakeInfo memory);
    }
}

// ---------------------------------------------------------------------------
// Provider port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderFault {
    #[error("user rejected the request")]
    Rejected,
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Pushed by the provider when the user switches account or network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas: Option<u64>,
    pub gas_price: Option<u128>,
}

/// A signing provider (browser-style wallet, node with unlocked accounts, …).
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderFault>;
    async fn chain_id(&self) -> Result<ChainId, ProviderFault>;
    async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64, ProviderFault>;
    async fn gas_price(&self) -> Result<u128, ProviderFault>;
    async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, ProviderFault>;
    async fn call(&self, tx: &TxRequest) -> Result<Bytes, ProviderFault>;
    /// Start delivering account / network changes relative to `session`,
    /// the state just adopted by `connect`.
    fn subscribe(&self, session: SessionInfo) -> mpsc::Receiver<ProviderEvent>;
}

// ---------------------------------------------------------------------------
// Contract handle cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractInterface {
    StockToken,
    StockVault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractHandle {
    pub address: Address,
    pub interface: ContractInterface,
}

/// One bound handle per contract address.
#[derive(Debug, Default)]
pub struct ContractCache {
    handles: RwLock<HashMap<Address, Arc<ContractHandle>>>,
}

impl ContractCache {
    pub fn get_or_bind(&self, address: Address, interface: ContractInterface) -> Arc<ContractHandle> {
        if let Some(handle) = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .filter(|h| h.interface == interface)
        {
            return Arc::clone(handle);
        }

        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        let entry = handles
            .entry(address)
            .or_insert_with(|| Arc::new(ContractHandle { address, interface }));
        if entry.interface != interface {
            *entry = Arc::new(ContractHandle { address, interface });
        }
        Arc::clone(entry)
    }

    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handles.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct SessionCore {
    state: watch::Sender<Option<SessionInfo>>,
    /// Bumped on every provider event and disconnect.
    epoch: AtomicU64,
}

impl SessionCore {
    fn apply(&self, event: ProviderEvent) {
        self.state.send_modify(|current| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *current = next_state(*current, &event);
        });
    }
}

fn next_state(current: Option<SessionInfo>, event: &ProviderEvent) -> Option<SessionInfo> {
    match (current, event) {
        (_, ProviderEvent::AccountsChanged(accounts)) if accounts.is_empty() => None,
        (Some(info), ProviderEvent::AccountsChanged(accounts)) => Some(SessionInfo {
            account: accounts[0],
            chain_id: info.chain_id,
        }),
        (Some(info), ProviderEvent::ChainChanged(chain_id)) => Some(SessionInfo {
            account: info.account,
            chain_id: *chain_id,
        }),
        // Events never create a session; only connect() does.
        (None, _) => None,
    }
}

/// `ceil(estimate × (100 + pct) / 100)`.
pub fn buffered_gas(estimate: u64, pct: u64) -> u64 {
    let scaled = (estimate as u128 * (100 + pct as u128)).div_ceil(100);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// WalletSession
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WalletSession {
    provider: Option<Arc<dyn WalletProvider>>,
    core: Arc<SessionCore>,
    contracts: Arc<ContractCache>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
    gas_buffer_pct: u64,
}

impl WalletSession {
    pub fn new(provider: Option<Arc<dyn WalletProvider>>, gas_buffer_pct: u64) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            provider,
            core: Arc::new(SessionCore {
                state,
                epoch: AtomicU64::new(0),
            }),
            contracts: Arc::new(ContractCache::default()),
            pump: Arc::new(Mutex::new(None)),
            gas_buffer_pct,
        }
    }

    /// Request account access and adopt the first account and current network.
    pub async fn connect(&self) -> Result<SessionInfo, OpError> {
        let provider = self.provider.as_ref().ok_or(OpError::ProviderUnavailable)?;
        let started = self.core.epoch.load(Ordering::SeqCst);

        let accounts = provider.request_accounts().await.map_err(|f| match f {
            ProviderFault::Rejected => OpError::UserRejected,
            other => OpError::ProviderError(other.to_string()),
        })?;
        let account = *accounts
            .first()
            .ok_or_else(|| OpError::ProviderError("provider returned no accounts".into()))?;
        let chain_id = provider
            .chain_id()
            .await
            .map_err(|f| OpError::ProviderError(f.to_string()))?;

        let info = SessionInfo { account, chain_id };
        let committed = self.core.state.send_if_modified(|current| {
            if self.core.epoch.load(Ordering::SeqCst) != started {
                return false;
            }
            *current = Some(info);
            true
        });
        if !committed {
            warn!("Wallet state changed while connecting; discarding stale connect result");
            return Err(OpError::ProviderError(
                "wallet account changed while connecting; try again".into(),
            ));
        }

        self.ensure_pump(provider, info);
        info!(
            "Wallet connected: {} on {}",
            short_address(&account),
            info.network_name()
        );
        Ok(info)
    }

    fn ensure_pump(&self, provider: &Arc<dyn WalletProvider>, session: SessionInfo) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let mut rx = provider.subscribe(session);
        let core: Weak<SessionCore> = Arc::downgrade(&self.core);
        *pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(core) = core.upgrade() else { break };
                debug!("Provider event: {event:?}");
                core.apply(event);
            }
            debug!("Provider event stream closed");
        }));
    }

    /// Apply one provider event as a single state replacement.
    pub fn apply_event(&self, event: ProviderEvent) {
        self.core.apply(event);
    }

    pub fn disconnect(&self) {
        self.core.state.send_modify(|current| {
            self.core.epoch.fetch_add(1, Ordering::SeqCst);
            *current = None;
        });
        if let Some(handle) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.contracts.clear();
        info!("Wallet disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.provider.is_some() && self.core.state.borrow().is_some()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        *self.core.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Option<SessionInfo>> {
        self.core.state.subscribe()
    }

    pub fn contract(&self, address: Address, interface: ContractInterface) -> Arc<ContractHandle> {
        self.contracts.get_or_bind(address, interface)
    }

    pub fn cached_contracts(&self) -> usize {
        self.contracts.len()
    }

    pub fn gas_buffer_pct(&self) -> u64 {
        self.gas_buffer_pct
    }

    /// Estimate, buffer, price and send `call` against `contract` from the
    /// connected account. Returns once the provider has accepted the
    /// transaction.
    pub async fn submit<C: SolCall>(
        &self,
        contract: &ContractHandle,
        call: &C,
        value: U256,
    ) -> Result<TxHash, OpError> {
        let provider = self.provider.as_ref().ok_or(OpError::ProviderUnavailable)?;
        let info = self
            .session()
            .ok_or_else(|| OpError::Validation("wallet is not connected".into()))?;

        let mut tx = TxRequest {
            from: info.account,
            to: contract.address,
            data: Bytes::from(call.abi_encode()),
            value,
            gas: None,
            gas_price: None,
        };

        let estimate = provider
            .estimate_gas(&tx)
            .await
            .map_err(|f| OpError::EstimationFailed(f.to_string()))?;
        let gas = buffered_gas(estimate, self.gas_buffer_pct);
        let gas_price = provider
            .gas_price()
            .await
            .map_err(|f| OpError::SubmissionFailed(f.to_string()))?;
        tx.gas = Some(gas);
        tx.gas_price = Some(gas_price);

        debug!(
            "Submitting {} to {} (gas {estimate} -> {gas}, price {gas_price})",
            C::SIGNATURE,
            short_address(&contract.address)
        );
        let hash = provider
            .send_transaction(&tx)
            .await
            .map_err(|f| OpError::SubmissionFailed(f.to_string()))?;
        info!("Transaction sent: {hash}");
        Ok(hash)
    }

    /// Read-only call, decoded with the call's return ABI.
    pub async fn read<C: SolCall>(&self, contract: &ContractHandle, call: &C) -> Result<C::Return, OpError> {
        let provider = self.provider.as_ref().ok_or(OpError::ProviderUnavailable)?;
        let tx = TxRequest {
            from: self.session().map(|s| s.account).unwrap_or(Address::ZERO),
            to: contract.address,
            data: Bytes::from(call.abi_encode()),
            value: U256::ZERO,
            gas: None,
            gas_price: None,
        };
        let data = provider
            .call(&tx)
            .await
            .map_err(|f| OpError::ProviderError(f.to_string()))?;
        C::abi_decode_returns(&data, true)
            .map_err(|e| OpError::ProviderError(format!("decoding {}: {e}", C::SIGNATURE)))
    }
}
