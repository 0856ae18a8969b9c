//! positions.rs – Borrowed-balance view and per-position lifecycle book.
use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::LedgerApi;
use crate::collateral::liquidation_risk;
use crate::errors::OpError;
use crate::models::{PositionKey, PositionState, TxHash};
use crate::wallet::{ContractInterface, IStockVault, WalletSession};

// ---------------------------------------------------------------------------
// Balance view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    pub account: Address,
    pub borrowed_total: Decimal,
    pub refreshed_at: DateTime<Utc>,
}

/// Latest backend-reported borrowed total, republished on a watch channel.
#[derive(Clone)]
pub struct BalanceView {
    ledger: Arc<dyn LedgerApi>,
    latest: Arc<watch::Sender<Option<BalanceSnapshot>>>,
}

impl BalanceView {
    pub fn new(ledger: Arc<dyn LedgerApi>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            ledger,
            latest: Arc::new(latest),
        }
    }

    /// Fetch and publish the borrowed total for `account`.
    ///
    /// No account is a no-op returning `Ok(None)`.
    pub async fn refresh(&self, account: Option<Address>) -> Result<Option<BalanceSnapshot>, OpError> {
        let Some(account) = account else {
            debug!("Balance refresh skipped: no connected account");
            return Ok(None);
        };
        let borrowed_total = self
            .ledger
            .fetch_balance(account)
            .await
            .map_err(|e| OpError::NetworkError(e.to_string()))?;
        let snapshot = BalanceSnapshot {
            account,
            borrowed_total,
            refreshed_at: Utc::now(),
        };
        self.latest.send_replace(Some(snapshot.clone()));
        info!("Borrowed balance: {borrowed_total}");
        Ok(Some(snapshot))
    }

    pub fn latest(&self) -> Option<BalanceSnapshot> {
        self.latest.borrow().clone()
    }

    /// The last snapshot, only if it belongs to `account`.
    pub fn snapshot_for(&self, account: Address) -> Option<BalanceSnapshot> {
        self.latest().filter(|s| s.account == account)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BalanceSnapshot>> {
        self.latest.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Position book
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct PositionEntry {
    state: PositionState,
    entry_price: Option<Decimal>,
}

/// In-memory lifecycle of every position touched in this process.
/// A key with no entry is `Unstaked`.
#[derive(Clone, Default)]
pub struct PositionBook {
    entries: Arc<RwLock<HashMap<PositionKey, PositionEntry>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, key: &PositionKey, state: PositionState, entry_price: Option<Decimal>) {
        debug!("{} {} -> {state}", key.chain, key.token_address);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let price = entry_price.or_else(|| entries.get(key).and_then(|e| e.entry_price));
        entries.insert(
            key.clone(),
            PositionEntry {
                state,
                entry_price: price,
            },
        );
    }

    /// Enter `Staking` and return whatever the position was before, for
    /// [`abort_staking`](Self::abort_staking).
    pub fn begin_staking(&self, key: &PositionKey) -> Option<PositionState> {
        let previous = self.get(key);
        self.set(key, PositionState::Staking { approval_tx: None }, None);
        previous
    }

    pub fn mark_approved(&self, key: &PositionKey, approval_tx: TxHash) {
        self.set(
            key,
            PositionState::Staking {
                approval_tx: Some(approval_tx),
            },
            None,
        );
    }

    pub fn mark_borrowed(&self, key: &PositionKey, borrowed: Decimal, tx_hash: TxHash, entry_price: Option<Decimal>) {
        self.set(key, PositionState::Borrowed { borrowed, tx_hash }, entry_price);
    }

    /// Undo a stake that never got past approval.
    pub fn abort_staking(&self, key: &PositionKey, previous: Option<PositionState>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match previous {
            Some(state) => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.state = state;
                }
            }
            None => {
                entries.remove(key);
            }
        }
    }

    pub fn mark_traded(&self, key: &PositionKey) {
        let borrowed = match self.get(key) {
            Some(PositionState::Borrowed { borrowed, .. }) | Some(PositionState::Traded { borrowed }) => borrowed,
            _ => Decimal::ZERO,
        };
        self.set(key, PositionState::Traded { borrowed }, None);
    }

    pub fn mark_redeemed(&self, key: &PositionKey) {
        self.set(key, PositionState::Redeemed, None);
    }

    pub fn get(&self, key: &PositionKey) -> Option<PositionState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.state.clone())
    }

    /// Positions whose approval is on-chain but whose settlement never landed.
    pub fn pending(&self) -> Vec<(PositionKey, TxHash)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(key, entry)| match entry.state {
                PositionState::Staking {
                    approval_tx: Some(tx),
                } => Some((key.clone(), tx)),
                _ => None,
            })
            .collect()
    }

    /// True when a borrowed position's price has fallen past `threshold`
    /// from the price it was opened at.
    pub fn at_risk(&self, key: &PositionKey, current_price: Decimal, threshold: Decimal) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(PositionEntry {
                state: PositionState::Borrowed { .. } | PositionState::Traded { .. },
                entry_price: Some(entry),
            }) => liquidation_risk(*entry, current_price, threshold),
            _ => false,
        }
    }

    /// Every borrowed or traded position whose token, priced by `price_of`,
    /// has fallen past `threshold`. Returns each key with its current price.
    pub fn flag_at_risk<F>(&self, threshold: Decimal, price_of: F) -> Vec<(PositionKey, Decimal)>
    where
        F: Fn(&Address) -> Option<Decimal>,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter_map(|(key, entry)| {
                if !matches!(entry.state, PositionState::Borrowed { .. } | PositionState::Traded { .. }) {
                    return None;
                }
                let current = price_of(&key.token_address)?;
                let opened_at = entry.entry_price?;
                liquidation_risk(opened_at, current, threshold).then(|| (key.clone(), current))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// On-chain stake info
// ---------------------------------------------------------------------------

/// Read the vault's record of `user`'s stake in `token`.
pub async fn fetch_stake_info(
    wallet: &WalletSession,
    vault: Address,
    user: Address,
    token: Address,
) -> Result<IStockVault::StakeInfo, OpError> {
    let handle = wallet.contract(vault, ContractInterface::StockVault);
    let ret = wallet
        .read(&handle, &IStockVault::getStakeInfoCall { user, token })
        .await?;
    Ok(ret._0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn key() -> PositionKey {
        PositionKey::new(Address::repeat_byte(1), Address::repeat_byte(2), "Reddio")
    }

    #[test]
    fn stake_lifecycle() {
        let book = PositionBook::new();
        assert_eq!(book.begin_staking(&key()), None);
        book.mark_approved(&key(), B256::repeat_byte(7));
        assert_eq!(book.pending().len(), 1);

        book.mark_borrowed(&key(), Decimal::from(100), B256::repeat_byte(7), Some(Decimal::from(150)));
        assert!(book.pending().is_empty());
        assert!(matches!(book.get(&key()), Some(PositionState::Borrowed { .. })));

        book.mark_traded(&key());
        assert_eq!(
            book.get(&key()),
            Some(PositionState::Traded {
                borrowed: Decimal::from(100)
            })
        );

        book.mark_redeemed(&key());
        assert_eq!(book.get(&key()), Some(PositionState::Redeemed));
    }

    #[test]
    fn abort_restores_previous_state() {
        let book = PositionBook::new();
        let previous = book.begin_staking(&key());
        book.abort_staking(&key(), previous);
        assert_eq!(book.get(&key()), None);

        book.mark_borrowed(&key(), Decimal::from(5), B256::ZERO, None);
        let previous = book.begin_staking(&key());
        book.abort_staking(&key(), previous);
        assert!(matches!(book.get(&key()), Some(PositionState::Borrowed { .. })));
    }

    #[test]
    fn risk_uses_entry_price() {
        let book = PositionBook::new();
        let threshold = Decimal::new(25, 2);
        book.mark_borrowed(&key(), Decimal::from(100), B256::ZERO, Some(Decimal::from(100)));
        assert!(book.at_risk(&key(), Decimal::from(70), threshold));
        assert!(!book.at_risk(&key(), Decimal::from(90), threshold));

        let other = PositionKey::new(Address::repeat_byte(9), Address::repeat_byte(2), "Reddio");
        assert!(!book.at_risk(&other, Decimal::from(1), threshold));
    }

    #[test]
    fn flag_skips_unpriced_and_pending_positions() {
        let book = PositionBook::new();
        let threshold = Decimal::new(25, 2);
        book.mark_borrowed(&key(), Decimal::from(100), B256::ZERO, Some(Decimal::from(100)));
        let pending = PositionKey::new(Address::repeat_byte(1), Address::repeat_byte(3), "Reddio");
        book.begin_staking(&pending);

        let flagged = book.flag_at_risk(threshold, |_| Some(Decimal::from(50)));
        assert_eq!(flagged, vec![(key(), Decimal::from(50))]);
        assert!(book.flag_at_risk(threshold, |_| None).is_empty());
        assert!(book.flag_at_risk(threshold, |_| Some(Decimal::from(90))).is_empty());
    }
}
