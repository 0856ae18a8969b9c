//! orchestrator.rs – Sequences wallet, chain and backend calls for each user
//! operation.
//!
//! Stake is two-phase: an on-chain `approve` from the wallet (phase A), then
//! the backend settlement that records the borrowed balance (phase B). Only a
//! successful settlement completes a stake. A confirmed approval followed by a
//! failed settlement ends in `PendingReconciliation`, which is journaled and
//! can be retried without approving again.
//!
//! Buy, sell and redeem are single backend calls. Every operation:
//!  - is rejected with `Busy` while another of the same kind is in flight
//!  - is abandoned (request dropped) if the wallet disconnects or switches
//!    account while it is suspended
//!  - refreshes the borrowed balance on success
use alloy_primitives::{Address, U256};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::{BackendClient, LedgerApi, LedgerError, RedeemRequest, SettlementRequest};
use crate::collateral::{
    borrowable_from_input, implied_stake_price, liquidation_risk, to_base_units, AssetTable,
};
use crate::config::{ChainConfig, Settings};
use crate::database::Journal;
use crate::errors::{OpError, OperationError};
use crate::models::{
    network_name, short_address, OperationKind, OperationRecord, OperationStatus, OrderIntent,
    PendingStake, PositionKey, PriceQuote, RedeemIntent, SessionInfo, StakeIntent, StakeResult,
    TxHash,
};
use crate::positions::{BalanceSnapshot, BalanceView, PositionBook};
use crate::prices::PriceCache;
use crate::rpc::RpcProvider;
use crate::wallet::{ContractInterface, IStockToken, WalletProvider, WalletSession};

// ---------------------------------------------------------------------------
// Stake state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakeState {
    Idle,
    Validating,
    Approving,
    Settling { approval_tx: TxHash },
    Done(StakeResult),
    /// Approval is on-chain; the backend never confirmed the stake.
    PendingReconciliation(PendingStake),
    /// Ended before anything was recorded by the backend.
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakeEvent {
    Validated,
    Approved(TxHash),
    Settled(StakeResult),
    SettlementFailed(PendingStake),
    Failed(String),
}

impl StakeEvent {
    fn as_str(&self) -> &'static str {
        match self {
            StakeEvent::Validated => "validated",
            StakeEvent::Approved(_) => "approved",
            StakeEvent::Settled(_) => "settled",
            StakeEvent::SettlementFailed(_) => "settlement-failed",
            StakeEvent::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal stake transition: {event} while {from}")]
pub struct IllegalTransition {
    pub from: &'static str,
    pub event: &'static str,
}

impl StakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakeState::Idle => "IDLE",
            StakeState::Validating => "VALIDATING",
            StakeState::Approving => "APPROVING",
            StakeState::Settling { .. } => "SETTLING",
            StakeState::Done(_) => "DONE",
            StakeState::PendingReconciliation(_) => "PENDING_RECONCILIATION",
            StakeState::Aborted(_) => "ABORTED",
        }
    }

    /// Entry point for a settlement retry: the approval already exists.
    pub fn resume(approval_tx: TxHash) -> Self {
        StakeState::Settling { approval_tx }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StakeState::Done(_) | StakeState::PendingReconciliation(_) | StakeState::Aborted(_)
        )
    }

    pub fn on(self, event: StakeEvent) -> Result<StakeState, IllegalTransition> {
        match (self, event) {
            (StakeState::Validating, StakeEvent::Validated) => Ok(StakeState::Approving),
            (StakeState::Approving, StakeEvent::Approved(approval_tx)) => {
                Ok(StakeState::Settling { approval_tx })
            }
            (StakeState::Validating | StakeState::Approving, StakeEvent::Failed(reason)) => {
                Ok(StakeState::Aborted(reason))
            }
            (StakeState::Settling { .. }, StakeEvent::Settled(result)) => Ok(StakeState::Done(result)),
            (StakeState::Settling { .. }, StakeEvent::SettlementFailed(pending)) => {
                Ok(StakeState::PendingReconciliation(pending))
            }
            (from, event) => Err(IllegalTransition {
                from: from.as_str(),
                event: event.as_str(),
            }),
        }
    }
}

impl std::fmt::Display for StakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct InFlight {
    active: Arc<Mutex<HashSet<OperationKind>>>,
}

/// Releases its operation kind when dropped.
struct InFlightGuard {
    active: Arc<Mutex<HashSet<OperationKind>>>,
    kind: OperationKind,
}

impl InFlight {
    fn acquire(&self, kind: OperationKind) -> Result<InFlightGuard, OpError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(kind) {
            return Err(OpError::Busy(kind));
        }
        Ok(InFlightGuard {
            active: Arc::clone(&self.active),
            kind,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.kind);
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Resolves once the session is gone or belongs to another account.
async fn session_ended(mut rx: watch::Receiver<Option<SessionInfo>>, account: Address) -> String {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            None => return "wallet disconnected".into(),
            Some(info) if info.account != account => {
                return format!("wallet switched to {}", short_address(&info.account))
            }
            Some(_) => {}
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    wallet: WalletSession,
    ledger: Arc<dyn LedgerApi>,
    prices: PriceCache,
    balances: BalanceView,
    positions: PositionBook,
    journal: Option<Arc<Journal>>,
    assets: Arc<AssetTable>,
    chains: Arc<BTreeMap<String, ChainConfig>>,
    in_flight: InFlight,
    stake_state: Arc<watch::Sender<StakeState>>,
    /// Pending stakes seen by this process, by operation id.
    pending: Arc<RwLock<HashMap<String, PendingStake>>>,
    /// Price drop (fraction) at which a position is flagged at risk.
    liquidation_drop: Decimal,
}

impl Orchestrator {
    pub fn new(
        wallet: WalletSession,
        ledger: Arc<dyn LedgerApi>,
        assets: AssetTable,
        chains: BTreeMap<String, ChainConfig>,
    ) -> Self {
        let (stake_state, _) = watch::channel(StakeState::Idle);
        Self {
            wallet,
            prices: PriceCache::new(Arc::clone(&ledger)),
            balances: BalanceView::new(Arc::clone(&ledger)),
            ledger,
            positions: PositionBook::new(),
            journal: None,
            assets: Arc::new(assets),
            chains: Arc::new(chains),
            in_flight: InFlight::default(),
            stake_state: Arc::new(stake_state),
            pending: Arc::new(RwLock::new(HashMap::new())),
            liquidation_drop: Decimal::new(25, 2),
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_liquidation_drop(mut self, drop: Decimal) -> Self {
        self.liquidation_drop = drop;
        self
    }

    /// Wire the HTTP backend, the optional RPC provider and the journal from
    /// configuration.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs_f64(settings.client.request_timeout_seconds);
        let ledger: Arc<dyn LedgerApi> =
            Arc::new(BackendClient::new(settings.backend.base_url.clone(), timeout)?);
        let provider: Option<Arc<dyn WalletProvider>> = match &settings.wallet.rpc_url {
            Some(url) => Some(Arc::new(RpcProvider::new(
                url.clone(),
                timeout,
                Duration::from_secs_f64(settings.wallet.event_poll_seconds),
            )?)),
            None => None,
        };
        let wallet = WalletSession::new(provider, settings.wallet.gas_buffer_pct);
        let journal = Journal::open(&settings.client.journal_path)?;
        info!("Journal opened: {}", settings.client.journal_path);
        Ok(Self::new(
            wallet,
            ledger,
            AssetTable::from_settings(settings),
            settings.chains.clone(),
        )
        .with_journal(Arc::new(journal))
        .with_liquidation_drop(settings.collateral.liquidation_drop_pct))
    }

    pub fn wallet(&self) -> &WalletSession {
        &self.wallet
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    pub fn balances(&self) -> &BalanceView {
        &self.balances
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn assets(&self) -> &AssetTable {
        &self.assets
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    pub fn stake_progress(&self) -> watch::Receiver<StakeState> {
        self.stake_state.subscribe()
    }

    /// Connect the wallet and load the account's borrowed balance.
    pub async fn connect(&self) -> Result<SessionInfo, OpError> {
        let info = self.wallet.connect().await?;
        if let Err(e) = self.balances.refresh(Some(info.account)).await {
            warn!("Initial balance refresh failed: {e}");
        }
        Ok(info)
    }

    pub async fn refresh_balance(&self) -> Result<Option<BalanceSnapshot>, OpError> {
        self.balances
            .refresh(self.wallet.session().map(|s| s.account))
            .await
    }

    /// Borrowable preview for `amount` of `token` at the cached price.
    pub fn quote(&self, token: &Address, amount: &str) -> Decimal {
        let price = self
            .assets
            .symbol_for(token)
            .map(|symbol| self.prices.get(symbol))
            .unwrap_or(PriceQuote::Unknown);
        borrowable_from_input(amount, price, self.assets.ratio_for(token))
    }

    /// Positions opened in this process whose token now trades more than
    /// the liquidation drop below its price at settlement.
    pub fn at_risk_positions(&self) -> Vec<(PositionKey, Decimal)> {
        let prices = self.prices.snapshot();
        self.positions.flag_at_risk(self.liquidation_drop, |token| {
            self.assets
                .symbol_for(token)
                .and_then(|symbol| prices.get(symbol).copied())
        })
    }

    /// Risk check for a stake read back from the vault: `staked` tokens of
    /// `token` backing `borrowed` SCOS. `None` when the cached price or the
    /// stake itself gives nothing to compare.
    pub fn stake_at_risk(&self, token: &Address, staked: Decimal, borrowed: Decimal) -> Option<bool> {
        let current = self
            .assets
            .symbol_for(token)
            .and_then(|symbol| self.prices.get(symbol).value())?;
        let opened_at = implied_stake_price(staked, borrowed, self.assets.ratio_for(token))?;
        Some(liquidation_risk(opened_at, current, self.liquidation_drop))
    }

    // ------------------------------------------------------------------
    // Stake
    // ------------------------------------------------------------------

    pub async fn stake(&self, intent: StakeIntent) -> Result<StakeResult, OperationError> {
        let op = OperationKind::Stake;
        let _guard = self.acquire(op)?;
        info!(
            "stake: {} of {} on {} (vault {})",
            intent.amount,
            short_address(&intent.token_address),
            intent.chain,
            short_address(&intent.vault_address)
        );

        let mut state = StakeState::Validating;
        self.stake_state.send_replace(state.clone());

        let validated = self
            .validate(&intent.chain, intent.token_address, intent.vault_address, Some(intent.amount))
            .and_then(|session| {
                let decimals = self.assets.decimals_for(&intent.token_address);
                Ok((session, to_base_units(intent.amount, decimals)?))
            });
        let (session, units) = match validated {
            Ok(v) => v,
            Err(e) => {
                self.advance(&mut state, StakeEvent::Failed(e.to_string()));
                warn!("stake rejected: {e}");
                return Err(OperationError::new(op, e));
            }
        };

        let mut record = OperationRecord::start(
            op,
            session.account,
            intent.token_address,
            &intent.chain,
            Some(intent.amount),
            intent.vault_address,
        );
        self.journal_write(&record);

        let key = PositionKey::new(session.account, intent.token_address, &intent.chain);
        let previous = self.positions.begin_staking(&key);
        self.advance(&mut state, StakeEvent::Validated);

        // Phase A: token approval from the wallet.
        let token = self.wallet.contract(intent.token_address, ContractInterface::StockToken);
        let approve = IStockToken::approveCall {
            spender: intent.vault_address,
            amount: units,
        };
        let approval = self
            .unless_session_ends(session.account, self.wallet.submit(&token, &approve, U256::ZERO))
            .await;
        let approval_tx = match approval {
            Ok(tx) => tx,
            Err(e) => {
                let kind = match e {
                    OpError::Cancelled(_) => e,
                    other => OpError::ApprovalFailed(other.to_string()),
                };
                self.positions.abort_staking(&key, previous);
                record.set_status(OperationStatus::Failed, Some(kind.to_string()));
                self.journal_write(&record);
                self.advance(&mut state, StakeEvent::Failed(kind.to_string()));
                error!("stake failed before settlement: {kind}");
                return Err(OperationError::new(op, kind));
            }
        };

        info!("stake: approval {approval_tx} submitted");
        self.positions.mark_approved(&key, approval_tx);
        self.advance(&mut state, StakeEvent::Approved(approval_tx));

        // Phase B: backend settlement.
        self.settle(
            &mut state,
            &mut record,
            session.account,
            intent,
            approval_tx,
            OperationStatus::Completed,
        )
        .await
        .map_err(|e| OperationError::new(op, e))
    }

    /// Run phase B again for a stake whose approval is already on-chain.
    pub async fn retry_settlement(&self, pending: &PendingStake) -> Result<StakeResult, OperationError> {
        let op = OperationKind::Stake;
        let _guard = self.acquire(op)?;
        info!(
            "stake: retrying settlement of {} (approval {})",
            pending.operation_id, pending.approval_tx
        );

        let intent = pending.intent.clone();
        let checked = self
            .validate(&intent.chain, intent.token_address, intent.vault_address, Some(intent.amount))
            .and_then(|session| {
                if session.account != pending.account {
                    return Err(OpError::Validation(format!(
                        "operation {} belongs to {}; connect that account first",
                        pending.operation_id,
                        short_address(&pending.account)
                    )));
                }
                Ok(session)
            })
            .and_then(|session| Ok((session, self.journaled_for_retry(pending)?)));
        let (session, mut record) = checked.map_err(|e| OperationError::new(op, e))?;

        let mut state = StakeState::resume(pending.approval_tx);
        self.stake_state.send_replace(state.clone());
        let key = PositionKey::new(session.account, intent.token_address, &intent.chain);
        self.positions.mark_approved(&key, pending.approval_tx);

        self.settle(
            &mut state,
            &mut record,
            session.account,
            intent,
            pending.approval_tx,
            OperationStatus::Reconciled,
        )
        .await
        .map_err(|e| OperationError::new(op, e))
    }

    fn journaled_for_retry(&self, pending: &PendingStake) -> Result<OperationRecord, OpError> {
        let stored = match &self.journal {
            Some(journal) => journal
                .get_operation(&pending.operation_id)
                .map_err(|e| OpError::Validation(format!("reading journal: {e}")))?,
            None => None,
        };
        match stored {
            Some(record) if record.status != OperationStatus::PendingReconciliation => Err(OpError::Validation(
                format!("operation {} is {}, not pending", record.operation_id, record.status),
            )),
            Some(record) => Ok(record),
            None => {
                let mut record = OperationRecord::start(
                    OperationKind::Stake,
                    pending.account,
                    pending.intent.token_address,
                    &pending.intent.chain,
                    Some(pending.intent.amount),
                    pending.intent.vault_address,
                );
                record.operation_id = pending.operation_id.clone();
                record.approval_tx = Some(pending.approval_tx);
                record.set_status(OperationStatus::PendingReconciliation, Some(pending.reason.clone()));
                Ok(record)
            }
        }
    }

    async fn settle(
        &self,
        state: &mut StakeState,
        record: &mut OperationRecord,
        account: Address,
        intent: StakeIntent,
        approval_tx: TxHash,
        success_status: OperationStatus,
    ) -> Result<StakeResult, OpError> {
        // Recorded as pending until the backend confirms, so a dropped call or
        // a killed process still leaves a retryable record.
        record.approval_tx = Some(approval_tx);
        record.set_status(
            OperationStatus::PendingReconciliation,
            Some("settlement not confirmed".into()),
        );
        self.journal_write(record);
        self.pending
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                record.operation_id.clone(),
                PendingStake {
                    operation_id: record.operation_id.clone(),
                    account,
                    intent: intent.clone(),
                    approval_tx,
                    reason: "settlement not confirmed".into(),
                },
            );

        let symbol = self.assets.symbol_for(&intent.token_address);
        let request = SettlementRequest::stake(account, &intent, symbol);
        let outcome = self
            .unless_session_ends(account, async {
                self.ledger.stake(&request).await.map_err(|e| match e {
                    LedgerError::Rejected(msg) => OpError::SettlementFailed {
                        approval_tx,
                        reason: format!("rejected: {msg}"),
                    },
                    other => OpError::SettlementFailed {
                        approval_tx,
                        reason: other.to_string(),
                    },
                })
            })
            .await;

        let key = PositionKey::new(account, intent.token_address, &intent.chain);
        match outcome {
            Ok(receipt) => {
                let result = StakeResult {
                    tx_hash: approval_tx,
                    settlement_tx: receipt.tx_hash.clone(),
                    borrowed: receipt.borrowed,
                };
                let entry_price = symbol.and_then(|s| self.prices.get(s).value());
                self.positions
                    .mark_borrowed(&key, receipt.borrowed, approval_tx, entry_price);
                record.borrowed = Some(receipt.borrowed);
                record.settlement_tx = receipt.tx_hash;
                record.detail = None;
                record.set_status(success_status, None);
                self.journal_write(record);
                self.pending
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&record.operation_id);
                self.advance(state, StakeEvent::Settled(result.clone()));
                info!("stake: settled, borrowed {}", result.borrowed);
                self.refresh_after(OperationKind::Stake, account).await;
                Ok(result)
            }
            Err(e) => {
                let reason = match &e {
                    OpError::SettlementFailed { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                let pending = PendingStake {
                    operation_id: record.operation_id.clone(),
                    account,
                    intent,
                    approval_tx,
                    reason: reason.clone(),
                };
                record.set_status(OperationStatus::PendingReconciliation, Some(reason.clone()));
                self.journal_write(record);
                self.pending
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(pending.operation_id.clone(), pending.clone());
                self.advance(state, StakeEvent::SettlementFailed(pending));
                error!(
                    "stake PARTIAL: approval {approval_tx} is on-chain but settlement failed: {reason} (operation {})",
                    record.operation_id
                );
                Err(OpError::SettlementFailed { approval_tx, reason })
            }
        }
    }

    // ------------------------------------------------------------------
    // Buy / sell / redeem
    // ------------------------------------------------------------------

    pub async fn buy(&self, intent: OrderIntent) -> Result<(), OperationError> {
        self.order(OperationKind::Buy, intent).await
    }

    pub async fn sell(&self, intent: OrderIntent) -> Result<(), OperationError> {
        self.order(OperationKind::Sell, intent).await
    }

    async fn order(&self, op: OperationKind, intent: OrderIntent) -> Result<(), OperationError> {
        let _guard = self.acquire(op)?;
        info!(
            "{op}: {} of {} on {}",
            intent.amount,
            short_address(&intent.token_address),
            intent.chain
        );
        let session = self
            .validate(&intent.chain, intent.token_address, intent.vault_address, Some(intent.amount))
            .map_err(|e| OperationError::new(op, e))?;

        let mut record = OperationRecord::start(
            op,
            session.account,
            intent.token_address,
            &intent.chain,
            Some(intent.amount),
            intent.vault_address,
        );
        self.journal_write(&record);

        let request = SettlementRequest::order(session.account, &intent);
        let outcome = self
            .unless_session_ends(session.account, async {
                let sent = match op {
                    OperationKind::Sell => self.ledger.sell(&request).await,
                    _ => self.ledger.buy(&request).await,
                };
                sent.map_err(|e| match e {
                    LedgerError::Rejected(msg) => OpError::OrderRejected(msg),
                    other => OpError::NetworkError(other.to_string()),
                })
            })
            .await;

        let key = PositionKey::new(session.account, intent.token_address, &intent.chain);
        self.finish(op, &mut record, session.account, outcome, || self.positions.mark_traded(&key))
            .await
    }

    pub async fn redeem(&self, intent: RedeemIntent) -> Result<(), OperationError> {
        let op = OperationKind::Redeem;
        let _guard = self.acquire(op)?;
        info!(
            "redeem: {} on {}",
            short_address(&intent.token_address),
            intent.chain
        );
        let session = self
            .validate(&intent.chain, intent.token_address, intent.vault_address, None)
            .map_err(|e| OperationError::new(op, e))?;

        let mut record = OperationRecord::start(
            op,
            session.account,
            intent.token_address,
            &intent.chain,
            None,
            intent.vault_address,
        );
        self.journal_write(&record);

        let request = RedeemRequest::new(session.account, &intent);
        let outcome = self
            .unless_session_ends(session.account, async {
                self.ledger.redeem(&request).await.map_err(|e| match e {
                    LedgerError::Rejected(msg) => OpError::RedeemRejected(msg),
                    other => OpError::NetworkError(other.to_string()),
                })
            })
            .await;

        let key = PositionKey::new(session.account, intent.token_address, &intent.chain);
        self.finish(op, &mut record, session.account, outcome, || self.positions.mark_redeemed(&key))
            .await
    }

    async fn finish(
        &self,
        op: OperationKind,
        record: &mut OperationRecord,
        account: Address,
        outcome: Result<(), OpError>,
        on_success: impl FnOnce(),
    ) -> Result<(), OperationError> {
        match outcome {
            Ok(()) => {
                on_success();
                record.set_status(OperationStatus::Completed, None);
                self.journal_write(record);
                info!("{op}: completed");
                self.refresh_after(op, account).await;
                Ok(())
            }
            Err(e) => {
                record.set_status(OperationStatus::Failed, Some(e.to_string()));
                self.journal_write(record);
                error!("{op} failed: {e}");
                Err(OperationError::new(op, e))
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending stakes
    // ------------------------------------------------------------------

    /// Every stake known to be waiting for reconciliation.
    pub fn pending_stakes(&self) -> anyhow::Result<Vec<PendingStake>> {
        let mut out: Vec<PendingStake> = match &self.journal {
            Some(journal) => journal
                .pending_reconciliation()?
                .iter()
                .filter_map(OperationRecord::as_pending_stake)
                .collect(),
            None => Vec::new(),
        };
        let memory = self.pending.read().unwrap_or_else(PoisonError::into_inner);
        for pending in memory.values() {
            if !out.iter().any(|p| p.operation_id == pending.operation_id) {
                out.push(pending.clone());
            }
        }
        Ok(out)
    }

    pub fn find_pending(&self, operation_id: &str) -> anyhow::Result<Option<PendingStake>> {
        Ok(self
            .pending_stakes()?
            .into_iter()
            .find(|p| p.operation_id == operation_id))
    }

    /// Record that a pending stake was settled outside this client.
    pub fn mark_reconciled(&self, operation_id: &str, note: Option<&str>) -> anyhow::Result<bool> {
        let in_memory = self
            .pending
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(operation_id)
            .is_some();
        let in_journal = match &self.journal {
            Some(journal) => journal.mark_reconciled(operation_id, note)?,
            None => false,
        };
        Ok(in_memory || in_journal)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn acquire(&self, op: OperationKind) -> Result<InFlightGuard, OperationError> {
        self.in_flight.acquire(op).map_err(|e| {
            warn!("{op} rejected: {e}");
            OperationError::new(op, e)
        })
    }

    fn validate(
        &self,
        chain: &str,
        token: Address,
        vault: Address,
        amount: Option<Decimal>,
    ) -> Result<SessionInfo, OpError> {
        let session = self
            .wallet
            .session()
            .ok_or_else(|| OpError::Validation("wallet is not connected".into()))?;
        if chain.trim().is_empty() {
            return Err(OpError::Validation("chain is required".into()));
        }
        if token == Address::ZERO {
            return Err(OpError::Validation("token address is required".into()));
        }
        if vault == Address::ZERO {
            return Err(OpError::Validation("vault address is required".into()));
        }
        if let Some(amount) = amount {
            if amount <= Decimal::ZERO {
                return Err(OpError::Validation(format!("amount must be > 0, got {amount}")));
            }
        }
        if !self.chains.is_empty() {
            let cfg = self
                .chains
                .get(chain)
                .ok_or_else(|| OpError::Validation(format!("unknown chain '{chain}'")))?;
            if cfg.chain_id != session.chain_id {
                return Err(OpError::Validation(format!(
                    "wallet is on {} but {chain} is {}",
                    session.network_name(),
                    network_name(cfg.chain_id)
                )));
            }
        }
        Ok(session)
    }

    /// Run `fut` unless the wallet disconnects or switches away from
    /// `account` first; in that case `fut` is dropped.
    async fn unless_session_ends<T, F>(&self, account: Address, fut: F) -> Result<T, OpError>
    where
        F: Future<Output = Result<T, OpError>>,
    {
        let ended = session_ended(self.wallet.watch(), account);
        tokio::select! {
            biased;
            out = fut => out,
            reason = ended => {
                warn!("Abandoning request: {reason}");
                Err(OpError::Cancelled(reason))
            }
        }
    }

    async fn refresh_after(&self, op: OperationKind, account: Address) {
        let refreshed = self
            .unless_session_ends(account, self.balances.refresh(Some(account)))
            .await;
        if let Err(e) = refreshed {
            warn!("Balance refresh after {op} failed: {e}");
        }
        for (key, price) in self.at_risk_positions() {
            warn!(
                "Position {} on {} is near liquidation: price {price}",
                short_address(&key.token_address),
                key.chain
            );
        }
    }

    fn advance(&self, state: &mut StakeState, event: StakeEvent) {
        match state.clone().on(event) {
            Ok(next) => {
                info!("stake: {} -> {}", state, next);
                *state = next.clone();
                self.stake_state.send_replace(next);
            }
            Err(e) => error!("{e}"),
        }
    }

    fn journal_write(&self, record: &OperationRecord) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.upsert_operation(record) {
                error!("Failed to journal {} {}: {e}", record.kind, record.operation_id);
            }
        }
    }
}
