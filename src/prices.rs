//! prices.rs – Process-wide cache of per-symbol reference prices.
//!
//! The cache holds one immutable snapshot at a time. `refresh_all` builds a
//! complete replacement off-lock and swaps it in; readers always see either
//! the old map or the new one.
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{LedgerApi, LedgerError};
use crate::errors::OpError;
use crate::models::PriceQuote;

pub type PriceMap = HashMap<String, Decimal>;

#[derive(Clone)]
pub struct PriceCache {
    ledger: Arc<dyn LedgerApi>,
    prices: Arc<RwLock<Arc<PriceMap>>>,
}

impl PriceCache {
    pub fn new(ledger: Arc<dyn LedgerApi>) -> Self {
        Self {
            ledger,
            prices: Arc::new(RwLock::new(Arc::new(PriceMap::new()))),
        }
    }

    /// Replace the whole cache with a fresh price list.
    ///
    /// Returns `false` (and keeps the previous snapshot) when the fetch fails.
    pub async fn refresh_all(&self) -> bool {
        let entries = match self.ledger.fetch_prices().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Price refresh failed, keeping {} cached price(s): {e}", self.len());
                return false;
            }
        };

        let mut next = PriceMap::with_capacity(entries.len());
        for entry in entries {
            if entry.price.is_sign_negative() && !entry.price.is_zero() {
                warn!("Dropping negative price for {}: {}", entry.symbol, entry.price);
                continue;
            }
            next.insert(entry.symbol, entry.price);
        }

        info!("Loaded {} price(s)", next.len());
        *self.prices.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        true
    }

    /// Fetch one symbol and upsert only that entry.
    pub async fn refresh_one(&self, symbol: &str) -> Result<Decimal, OpError> {
        let price = self.ledger.fetch_price(symbol).await.map_err(|e| match e {
            LedgerError::Rejected(msg) => OpError::Validation(format!("price for {symbol}: {msg}")),
            other => OpError::NetworkError(other.to_string()),
        })?;
        if price.is_sign_negative() && !price.is_zero() {
            return Err(OpError::NetworkError(format!(
                "backend returned negative price {price} for {symbol}"
            )));
        }

        let mut guard = self.prices.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = PriceMap::clone(&guard);
        next.insert(symbol.to_string(), price);
        *guard = Arc::new(next);
        debug!("{symbol} = {price}");
        Ok(price)
    }

    pub fn get(&self, symbol: &str) -> PriceQuote {
        match self.snapshot().get(symbol) {
            Some(p) => PriceQuote::Known(*p),
            None => PriceQuote::Unknown,
        }
    }

    pub fn snapshot(&self) -> Arc<PriceMap> {
        Arc::clone(&self.prices.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
