//! In-memory fakes of the wallet provider and backend ledger that record
//! every outbound call.
#![allow(dead_code)]

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, Notify};

use scos_staking_client::backend::{LedgerApi, LedgerError, RedeemRequest, SettlementRequest, StakeReceipt};
use scos_staking_client::collateral::AssetTable;
use scos_staking_client::config::{AssetConfig, ChainConfig};
use scos_staking_client::database::Journal;
use scos_staking_client::models::{
    ChainId, OrderIntent, PriceEntry, RedeemIntent, SessionInfo, StakeIntent, TxHash,
};
use scos_staking_client::orchestrator::Orchestrator;
use scos_staking_client::wallet::{ProviderEvent, ProviderFault, TxRequest, WalletProvider, WalletSession};

pub const CHAIN: &str = "Reddio";
pub const CHAIN_ID: ChainId = 50341;

pub fn account() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn other_account() -> Address {
    Address::repeat_byte(0xbb)
}

pub fn token() -> Address {
    Address::repeat_byte(0x11)
}

pub fn vault() -> Address {
    Address::repeat_byte(0x22)
}

pub fn approval_hash() -> TxHash {
    B256::repeat_byte(0x77)
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

pub struct MockProvider {
    pub accounts: Mutex<Result<Vec<Address>, ProviderFault>>,
    pub chain_id: Mutex<ChainId>,
    pub estimate: Mutex<Result<u64, ProviderFault>>,
    pub gas_price: u128,
    pub send_result: Mutex<Result<TxHash, ProviderFault>>,
    pub call_result: Mutex<Result<Bytes, ProviderFault>>,
    pub sent: Mutex<Vec<TxRequest>>,
    pub estimated: Mutex<Vec<TxRequest>>,
    pub events: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
    pub subscribed: Mutex<Vec<SessionInfo>>,
    pub send_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(Ok(vec![account()])),
            chain_id: Mutex::new(CHAIN_ID),
            estimate: Mutex::new(Ok(100_000)),
            gas_price: 1_000_000_000,
            send_result: Mutex::new(Ok(approval_hash())),
            call_result: Mutex::new(Ok(Bytes::new())),
            sent: Mutex::new(Vec::new()),
            estimated: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            subscribed: Mutex::new(Vec::new()),
            send_gate: Mutex::new(None),
        }
    }

    pub fn sent(&self) -> Vec<TxRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// Make the next `send_transaction` (only) wait until the returned gate is notified.
    pub fn gate_send(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Sender half of the event channel handed out by `subscribe`.
    pub fn events(&self) -> mpsc::Sender<ProviderEvent> {
        self.events.lock().unwrap().clone().expect("not subscribed yet")
    }
}

#[async_trait]
impl WalletProvider for MockProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderFault> {
        self.accounts.lock().unwrap().clone()
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderFault> {
        Ok(*self.chain_id.lock().unwrap())
    }

    async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64, ProviderFault> {
        self.estimated.lock().unwrap().push(tx.clone());
        self.estimate.lock().unwrap().clone()
    }

    async fn gas_price(&self) -> Result<u128, ProviderFault> {
        Ok(self.gas_price)
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, ProviderFault> {
        let gate = self.send_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = self.send_result.lock().unwrap().clone();
        if result.is_ok() {
            self.sent.lock().unwrap().push(tx.clone());
        }
        result
    }

    async fn call(&self, _tx: &TxRequest) -> Result<Bytes, ProviderFault> {
        self.call_result.lock().unwrap().clone()
    }

    fn subscribe(&self, session: SessionInfo) -> mpsc::Receiver<ProviderEvent> {
        self.subscribed.lock().unwrap().push(session);
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock().unwrap() = Some(tx);
        rx
    }
}

// ---------------------------------------------------------------------------
// MockLedger
// ---------------------------------------------------------------------------

pub struct MockLedger {
    pub prices: Mutex<Result<Vec<PriceEntry>, LedgerError>>,
    pub single_prices: Mutex<HashMap<String, Decimal>>,
    pub balance: Mutex<Result<Decimal, LedgerError>>,
    pub stake_result: Mutex<Result<StakeReceipt, LedgerError>>,
    pub order_result: Mutex<Result<(), LedgerError>>,
    pub redeem_result: Mutex<Result<(), LedgerError>>,
    pub calls: Mutex<Vec<String>>,
    pub settlements: Mutex<Vec<SettlementRequest>>,
    pub gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(Ok(vec![
                PriceEntry {
                    symbol: "APPLE".into(),
                    price: dec("150"),
                },
                PriceEntry {
                    symbol: "GOOGLE".into(),
                    price: dec("100"),
                },
            ])),
            single_prices: Mutex::new(HashMap::new()),
            balance: Mutex::new(Ok(dec("250"))),
            stake_result: Mutex::new(Ok(StakeReceipt {
                borrowed: dec("10000"),
                tx_hash: Some("0xsettled".into()),
            })),
            order_result: Mutex::new(Ok(())),
            redeem_result: Mutex::new(Ok(())),
            calls: Mutex::new(Vec::new()),
            settlements: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Make the next `call` (only) wait until the returned gate is notified.
    pub fn gate(&self, call: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(call.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn gate_stake(&self) -> Arc<Notify> {
        self.gate("stake")
    }

    async fn pass_gate(&self, call: &str) {
        let gate = self.gates.lock().unwrap().remove(call);
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl LedgerApi for MockLedger {
    async fn fetch_prices(&self) -> Result<Vec<PriceEntry>, LedgerError> {
        self.record("prices");
        self.prices.lock().unwrap().clone()
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, LedgerError> {
        self.record("price");
        self.single_prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| LedgerError::Rejected("Price not found".into()))
    }

    async fn fetch_balance(&self, _account: Address) -> Result<Decimal, LedgerError> {
        self.record("balance");
        self.balance.lock().unwrap().clone()
    }

    async fn stake(&self, req: &SettlementRequest) -> Result<StakeReceipt, LedgerError> {
        self.record("stake");
        self.settlements.lock().unwrap().push(req.clone());
        self.pass_gate("stake").await;
        self.stake_result.lock().unwrap().clone()
    }

    async fn buy(&self, req: &SettlementRequest) -> Result<(), LedgerError> {
        self.record("buy");
        self.settlements.lock().unwrap().push(req.clone());
        self.pass_gate("buy").await;
        self.order_result.lock().unwrap().clone()
    }

    async fn sell(&self, req: &SettlementRequest) -> Result<(), LedgerError> {
        self.record("sell");
        self.settlements.lock().unwrap().push(req.clone());
        self.pass_gate("sell").await;
        self.order_result.lock().unwrap().clone()
    }

    async fn redeem(&self, _req: &RedeemRequest) -> Result<(), LedgerError> {
        self.record("redeem");
        self.pass_gate("redeem").await;
        self.redeem_result.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orch: Orchestrator,
    pub provider: Arc<MockProvider>,
    pub ledger: Arc<MockLedger>,
    pub journal: Arc<Journal>,
    _db: NamedTempFile,
}

pub fn assets() -> AssetTable {
    AssetTable::new(
        &[AssetConfig {
            symbol: "APPLE".into(),
            token_address: token(),
            decimals: 6,
            collateral_ratio: None,
        }],
        6,
        dec("1.4"),
    )
}

pub fn chains() -> BTreeMap<String, ChainConfig> {
    let mut chains = BTreeMap::new();
    chains.insert(
        CHAIN.to_string(),
        ChainConfig {
            chain_id: CHAIN_ID,
            vault_address: vault(),
        },
    );
    chains
}

pub fn harness() -> Harness {
    let provider = Arc::new(MockProvider::new());
    let ledger = Arc::new(MockLedger::new());
    let db = NamedTempFile::new().expect("tempfile");
    let journal = Arc::new(Journal::open(db.path().to_str().unwrap()).expect("open journal"));
    let wallet = WalletSession::new(Some(provider.clone() as Arc<dyn WalletProvider>), 20);
    let orch = Orchestrator::new(wallet, ledger.clone(), assets(), chains()).with_journal(journal.clone());
    Harness {
        orch,
        provider,
        ledger,
        journal,
        _db: db,
    }
}

pub fn stake_intent(amount: &str) -> StakeIntent {
    StakeIntent {
        chain: CHAIN.into(),
        token_address: token(),
        amount: dec(amount),
        vault_address: vault(),
    }
}

pub fn order_intent(amount: &str) -> OrderIntent {
    OrderIntent {
        chain: CHAIN.into(),
        token_address: token(),
        amount: dec(amount),
        vault_address: vault(),
    }
}

pub fn redeem_intent() -> RedeemIntent {
    RedeemIntent {
        chain: CHAIN.into(),
        token_address: token(),
        vault_address: vault(),
    }
}
