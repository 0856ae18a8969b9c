//! models.rs – Core data types shared across the client modules.
use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::OpError;

pub type ChainId = u64;
pub type TxHash = B256;

// ---------------------------------------------------------------------------
// Wallet session
// ---------------------------------------------------------------------------

/// The connected account and the network it is on. A session either has both
/// or does not exist at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub account: Address,
    pub chain_id: ChainId,
}

impl SessionInfo {
    pub fn network_name(&self) -> String {
        network_name(self.chain_id)
    }
}

/// Human-readable name for the networks the front-end knows about.
pub fn network_name(chain_id: ChainId) -> String {
    match chain_id {
        1 => "Ethereum".into(),
        5 => "Goerli".into(),
        56 => "BSC".into(),
        137 => "Polygon".into(),
        31337 => "Local".into(),
        50341 => "Reddio".into(),
        534351 => "Scroll Sepolia".into(),
        other => format!("Chain {other}"),
    }
}

/// `0x36a1…3167` style abbreviation for logs and terminal output.
pub fn short_address(addr: &Address) -> String {
    let full = addr.to_checksum(None);
    format!("{}…{}", &full[..6], &full[full.len() - 4..])
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub symbol: String,
    pub price: Decimal,
}

/// Result of a price lookup. `Unknown` is a normal answer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceQuote {
    Known(Decimal),
    Unknown,
}

impl PriceQuote {
    pub fn value(self) -> Option<Decimal> {
        match self {
            PriceQuote::Known(p) => Some(p),
            PriceQuote::Unknown => None,
        }
    }

    pub fn value_or_zero(self) -> Decimal {
        self.value().unwrap_or(Decimal::ZERO)
    }

    pub fn is_known(self) -> bool {
        matches!(self, PriceQuote::Known(_))
    }
}

// ---------------------------------------------------------------------------
// User intents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeIntent {
    pub chain: String,
    pub token_address: Address,
    pub amount: Decimal,
    pub vault_address: Address,
}

/// Buy and sell orders carry the same fields as a stake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub chain: String,
    pub token_address: Address,
    pub amount: Decimal,
    pub vault_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemIntent {
    pub chain: String,
    pub token_address: Address,
    pub vault_address: Address,
}

/// Parse a user-supplied contract address.
pub fn parse_address(field: &str, input: &str) -> Result<Address, OpError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(OpError::Validation(format!("{field} is required")));
    }
    let addr = Address::from_str(trimmed)
        .map_err(|e| OpError::Validation(format!("{field} '{trimmed}' is not an address: {e}")))?;
    if addr == Address::ZERO {
        return Err(OpError::Validation(format!("{field} must not be the zero address")));
    }
    Ok(addr)
}

/// Parse a user-supplied quantity; it must be a number strictly above zero.
pub fn parse_amount(input: &str) -> Result<Decimal, OpError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(OpError::Validation("amount is required".into()));
    }
    let amount = Decimal::from_str(trimmed)
        .map_err(|_| OpError::Validation(format!("amount '{trimmed}' is not a number")))?;
    if amount <= Decimal::ZERO {
        return Err(OpError::Validation(format!("amount must be > 0, got {amount}")));
    }
    Ok(amount)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A completed stake. Only the backend settlement produces one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeResult {
    /// Hash of the approval transaction submitted from the wallet.
    pub tx_hash: TxHash,
    /// Transaction hash reported by the backend for its on-chain stake, if any.
    pub settlement_tx: Option<String>,
    pub borrowed: Decimal,
}

/// A stake whose approval landed but whose settlement was never confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStake {
    pub operation_id: String,
    pub account: Address,
    pub intent: StakeIntent,
    pub approval_tx: TxHash,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub account: Address,
    pub token_address: Address,
    pub chain: String,
}

impl PositionKey {
    pub fn new(account: Address, token_address: Address, chain: &str) -> Self {
        Self {
            account,
            token_address,
            chain: chain.to_string(),
        }
    }
}

/// Lifecycle of one position. Absence from the book means `Unstaked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    /// Approval requested or confirmed; no borrowed balance recorded yet.
    Staking { approval_tx: Option<TxHash> },
    Borrowed { borrowed: Decimal, tx_hash: TxHash },
    Traded { borrowed: Decimal },
    Redeemed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Staking { approval_tx: None } => "STAKING",
            PositionState::Staking { approval_tx: Some(_) } => "STAKING_PENDING",
            PositionState::Borrowed { .. } => "BORROWED",
            PositionState::Traded { .. } => "TRADED",
            PositionState::Redeemed => "REDEEMED",
        }
    }

    /// Approval confirmed but settlement never recorded.
    pub fn is_pending(&self) -> bool {
        matches!(self, PositionState::Staking { approval_tx: Some(_) })
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Stake,
    Buy,
    Sell,
    Redeem,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Stake => "stake",
            OperationKind::Buy => "buy",
            OperationKind::Sell => "sell",
            OperationKind::Redeem => "redeem",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stake" => Ok(OperationKind::Stake),
            "buy" => Ok(OperationKind::Buy),
            "sell" => Ok(OperationKind::Sell),
            "redeem" => Ok(OperationKind::Redeem),
            _ => Err(anyhow::anyhow!("Unknown operation kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    InFlight,
    Completed,
    Failed,
    /// Approved on-chain, settlement unconfirmed.
    PendingReconciliation,
    /// A pending stake that was later resolved by retry or by hand.
    Reconciled,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::InFlight => "IN_FLIGHT",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::PendingReconciliation => "PENDING_RECONCILIATION",
            OperationStatus::Reconciled => "RECONCILED",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_FLIGHT" => Ok(OperationStatus::InFlight),
            "COMPLETED" => Ok(OperationStatus::Completed),
            "FAILED" => Ok(OperationStatus::Failed),
            "PENDING_RECONCILIATION" => Ok(OperationStatus::PendingReconciliation),
            "RECONCILED" => Ok(OperationStatus::Reconciled),
            _ => Err(anyhow::anyhow!("Unknown operation status: {s}")),
        }
    }
}

/// One journaled user operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub kind: OperationKind,
    pub account: Address,
    pub token_address: Address,
    pub chain: String,
    pub amount: Option<Decimal>,
    pub vault_address: Address,
    pub status: OperationStatus,
    pub approval_tx: Option<TxHash>,
    pub settlement_tx: Option<String>,
    pub borrowed: Option<Decimal>,
    /// Failure reason or free-form note.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn start(
        kind: OperationKind,
        account: Address,
        token_address: Address,
        chain: &str,
        amount: Option<Decimal>,
        vault_address: Address,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            kind,
            account,
            token_address,
            chain: chain.to_string(),
            amount,
            vault_address,
            status: OperationStatus::InFlight,
            approval_tx: None,
            settlement_tx: None,
            borrowed: None,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: OperationStatus, detail: Option<String>) {
        self.status = status;
        if detail.is_some() {
            self.detail = detail;
        }
        self.updated_at = Utc::now();
    }

    /// Rebuild the pending-stake view of a journaled stake, if it is one.
    pub fn as_pending_stake(&self) -> Option<PendingStake> {
        if self.kind != OperationKind::Stake || self.status != OperationStatus::PendingReconciliation {
            return None;
        }
        Some(PendingStake {
            operation_id: self.operation_id.clone(),
            account: self.account,
            intent: StakeIntent {
                chain: self.chain.clone(),
                token_address: self.token_address,
                amount: self.amount?,
                vault_address: self.vault_address,
            },
            approval_tx: self.approval_tx?,
            reason: self.detail.clone().unwrap_or_default(),
        })
    }
}
