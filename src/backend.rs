//! backend.rs – Async client for the settlement backend's REST API.
//!
//! Responsibilities:
//!  - Fetch the full price list and single-symbol prices
//!  - Fetch an account's borrowed-balance total
//!  - Submit stake / buy / sell / redeem settlement requests
use alloy_primitives::Address;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{OrderIntent, PriceEntry, RedeemIntent, StakeIntent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The backend answered and refused; carries its message.
    #[error("{0}")]
    Rejected(String),
    /// The request did not complete.
    #[error("{0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LedgerError::Decode(err.to_string())
        } else {
            LedgerError::Network(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body of `POST /stake`, `/buy` and `/sell`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementRequest {
    pub user_address: String,
    pub token_address: String,
    pub chain: String,
    pub amount: String,
    pub contract_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_symbol: Option<String>,
}

impl SettlementRequest {
    pub fn stake(account: Address, intent: &StakeIntent, symbol: Option<&str>) -> Self {
        Self {
            user_address: account.to_checksum(None),
            token_address: intent.token_address.to_checksum(None),
            chain: intent.chain.clone(),
            amount: intent.amount.normalize().to_string(),
            contract_address: intent.vault_address.to_checksum(None),
            stock_symbol: symbol.map(str::to_string),
        }
    }

    pub fn order(account: Address, intent: &OrderIntent) -> Self {
        Self {
            user_address: account.to_checksum(None),
            token_address: intent.token_address.to_checksum(None),
            chain: intent.chain.clone(),
            amount: intent.amount.normalize().to_string(),
            contract_address: intent.vault_address.to_checksum(None),
            stock_symbol: None,
        }
    }
}

/// Body of `POST /redeem`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemRequest {
    pub user_address: String,
    pub token_address: String,
    pub chain: String,
    pub contract_address: String,
}

impl RedeemRequest {
    pub fn new(account: Address, intent: &RedeemIntent) -> Self {
        Self {
            user_address: account.to_checksum(None),
            token_address: intent.token_address.to_checksum(None),
            chain: intent.chain.clone(),
            contract_address: intent.vault_address.to_checksum(None),
        }
    }
}

/// What the backend returns for a recorded stake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeReceipt {
    pub borrowed: Decimal,
    pub tx_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// The backend ledger as the client sees it.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn fetch_prices(&self) -> Result<Vec<PriceEntry>, LedgerError>;
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, LedgerError>;
    async fn fetch_balance(&self, account: Address) -> Result<Decimal, LedgerError>;
    async fn stake(&self, req: &SettlementRequest) -> Result<StakeReceipt, LedgerError>;
    async fn buy(&self, req: &SettlementRequest) -> Result<(), LedgerError>;
    async fn sell(&self, req: &SettlementRequest) -> Result<(), LedgerError>;
    async fn redeem(&self, req: &RedeemRequest) -> Result<(), LedgerError>;
}

// ---------------------------------------------------------------------------
// BackendClient
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BackendClient {
    pub base_url: Url,
    http: Client,
}

impl BackendClient {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("invalid backend URL {base_url}: {e}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("backend URL {base_url} cannot carry a path");
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building HTTP client: {e}"))?;
        Ok(Self { base_url, http })
    }

    async fn get_json(&self, path: &[&str]) -> Result<Value, LedgerError> {
        let url = endpoint(&self.base_url, path)?;
        debug!("GET {url}");
        let resp = self.http.get(url).send().await?;
        read_body(resp.status(), resp.text().await?)
    }

    async fn post_json<B: Serialize + Sync>(&self, path: &[&str], body: &B) -> Result<Value, LedgerError> {
        let url = endpoint(&self.base_url, path)?;
        debug!("POST {url}");
        let resp = self.http.post(url).json(body).send().await?;
        read_body(resp.status(), resp.text().await?)
    }
}

/// Append `segments` to `base`, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, LedgerError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| LedgerError::Network(format!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl LedgerApi for BackendClient {
    async fn fetch_prices(&self) -> Result<Vec<PriceEntry>, LedgerError> {
        let body = self.get_json(&["stocks", "prices"]).await?;
        parse_price_list(&body)
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, LedgerError> {
        let body = self.get_json(&["stock", symbol, "price"]).await?;
        body.get("price")
            .and_then(value_as_decimal)
            .ok_or_else(|| LedgerError::Decode(format!("no price for {symbol}")))
    }

    async fn fetch_balance(&self, account: Address) -> Result<Decimal, LedgerError> {
        let account = account.to_checksum(None);
        let body = self.get_json(&["user", &account, "balance"]).await?;
        parse_balance(&body)
    }

    async fn stake(&self, req: &SettlementRequest) -> Result<StakeReceipt, LedgerError> {
        info!(
            "Settling stake {} {} on {}",
            req.amount, req.token_address, req.chain
        );
        let body = self.post_json(&["stake"], req).await?;
        parse_stake_receipt(&body)
    }

    async fn buy(&self, req: &SettlementRequest) -> Result<(), LedgerError> {
        info!("BUY {} {} on {}", req.amount, req.token_address, req.chain);
        self.post_json(&["buy"], req).await.map(|_| ())
    }

    async fn sell(&self, req: &SettlementRequest) -> Result<(), LedgerError> {
        info!("SELL {} {} on {}", req.amount, req.token_address, req.chain);
        self.post_json(&["sell"], req).await.map(|_| ())
    }

    async fn redeem(&self, req: &RedeemRequest) -> Result<(), LedgerError> {
        info!("REDEEM {} on {}", req.token_address, req.chain);
        self.post_json(&["redeem"], req).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Classify a response: an `error` field wins over the status code.
fn read_body(status: StatusCode, text: String) -> Result<Value, LedgerError> {
    let body: Value = if text.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) if status.is_success() => return Err(LedgerError::Decode(e.to_string())),
            Err(_) => return Err(LedgerError::Network(format!("HTTP {status}"))),
        }
    };

    if let Some(msg) = body.get("error").and_then(|v| v.as_str()) {
        return Err(LedgerError::Rejected(msg.to_string()));
    }
    if !status.is_success() {
        return Err(LedgerError::Network(format!("HTTP {status}")));
    }
    Ok(body)
}

fn parse_price_list(body: &Value) -> Result<Vec<PriceEntry>, LedgerError> {
    let items = body
        .get("stocks")
        .and_then(|v| v.as_array())
        .ok_or_else(|| LedgerError::Decode("missing 'stocks' array".into()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            let symbol = item.get("symbol")?.as_str()?;
            let price = item.get("price").and_then(value_as_decimal)?;
            Some(PriceEntry {
                symbol: symbol.to_string(),
                price,
            })
        })
        .collect())
}

fn parse_balance(body: &Value) -> Result<Decimal, LedgerError> {
    body.get("balance")
        .or_else(|| body.get("scos_balance"))
        .and_then(value_as_decimal)
        .ok_or_else(|| LedgerError::Decode("missing 'balance'".into()))
}

fn parse_stake_receipt(body: &Value) -> Result<StakeReceipt, LedgerError> {
    let borrowed = body
        .get("scos_borrowed")
        .and_then(value_as_decimal)
        .ok_or_else(|| LedgerError::Decode("missing 'scos_borrowed'".into()))?;
    Ok(StakeReceipt {
        borrowed,
        tx_hash: body
            .get("tx_hash")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

/// JSON numbers and numeric strings are both accepted.
fn value_as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}
