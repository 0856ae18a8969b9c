//! errors.rs – Typed failures surfaced by the wallet, backend and orchestrator layers.
use thiserror::Error;

use crate::models::{OperationKind, TxHash};

/// Every way a user operation can end without success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// Bad or missing input, caught before any I/O.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("no wallet provider is available")]
    ProviderUnavailable,

    #[error("request was rejected in the wallet")]
    UserRejected,

    #[error("wallet provider error: {0}")]
    ProviderError(String),

    /// Usually means the call would revert on-chain.
    #[error("gas estimation failed: {0}")]
    EstimationFailed(String),

    #[error("transaction submission failed: {0}")]
    SubmissionFailed(String),

    #[error("token approval failed: {0}")]
    ApprovalFailed(String),

    /// The approval is already on-chain; the backend never confirmed the stake.
    #[error("approval {approval_tx} confirmed but settlement failed: {reason}")]
    SettlementFailed { approval_tx: TxHash, reason: String },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("redeem rejected: {0}")]
    RedeemRejected(String),

    #[error("another {0} is already in progress")]
    Busy(OperationKind),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl OpError {
    /// True when the failure happened before anything left the client.
    pub fn nothing_happened(&self) -> bool {
        matches!(
            self,
            OpError::Validation(_) | OpError::Busy(_) | OpError::ProviderUnavailable
        )
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, OpError::SettlementFailed { .. })
    }
}

/// An [`OpError`] tagged with the operation it ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed: {kind}")]
pub struct OperationError {
    pub op: OperationKind,
    #[source]
    pub kind: OpError,
}

impl OperationError {
    pub fn new(op: OperationKind, kind: OpError) -> Self {
        Self { op, kind }
    }

    pub fn is_partial(&self) -> bool {
        self.kind.is_partial()
    }

    pub fn nothing_happened(&self) -> bool {
        self.kind.nothing_happened()
    }

    /// Text for the terminal: partial successes must not read as plain failures.
    pub fn user_message(&self) -> String {
        match &self.kind {
            OpError::SettlementFailed { approval_tx, reason } => format!(
                "{} PARTIALLY completed: token approval {approval_tx} is on-chain but the \
                 backend did not record the stake ({reason}). The position is pending \
                 reconciliation; retry the settlement instead of staking again.",
                self.op
            ),
            _ => self.to_string(),
        }
    }
}
