//! rpc.rs – `WalletProvider` over JSON-RPC 2.0 / HTTP.
//!
//! Talks to any endpoint that signs on behalf of its accounts (a wallet
//! gateway or a dev node with unlocked accounts). Account and network changes
//! are discovered by polling.
use alloy_primitives::{hex, Address, Bytes, B256};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{ChainId, SessionInfo, TxHash};
use crate::wallet::{ProviderEvent, ProviderFault, TxRequest, WalletProvider};

const METHOD_NOT_FOUND: i64 = -32601;
const USER_REJECTED: i64 = 4001;
const EXECUTION_REVERTED: i64 = 3;

#[derive(Clone)]
pub struct RpcProvider {
    url: String,
    http: Client,
    next_id: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl RpcProvider {
    pub fn new(url: String, timeout: Duration, poll_interval: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building RPC client: {e}"))?;
        Ok(Self {
            url,
            http,
            next_id: Arc::new(AtomicU64::new(1)),
            poll_interval,
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderFault> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!("RPC {method} #{id}");
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFault::Transport(e.to_string()))?;
        let status = resp.status();
        let reply: Value = resp
            .json()
            .await
            .map_err(|e| ProviderFault::Transport(format!("HTTP {status}: {e}")))?;
        unwrap_reply(reply)
    }

    async fn accounts(&self) -> Result<Vec<Address>, ProviderFault> {
        let result = self.request("eth_accounts", json!([])).await?;
        parse_accounts(&result)
    }
}

#[async_trait]
impl WalletProvider for RpcProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderFault> {
        match self.request("eth_requestAccounts", json!([])).await {
            Ok(result) => parse_accounts(&result),
            Err(ProviderFault::Rpc { code, .. }) if code == METHOD_NOT_FOUND => self.accounts().await,
            Err(e) => Err(e),
        }
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderFault> {
        let result = self.request("eth_chainId", json!([])).await?;
        let id = parse_quantity(&result)?;
        u64::try_from(id).map_err(|_| ProviderFault::Transport(format!("chain id {id} out of range")))
    }

    async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64, ProviderFault> {
        let result = self.request("eth_estimateGas", json!([tx_to_json(tx)])).await?;
        let gas = parse_quantity(&result)?;
        u64::try_from(gas).map_err(|_| ProviderFault::Transport(format!("gas estimate {gas} out of range")))
    }

    async fn gas_price(&self) -> Result<u128, ProviderFault> {
        let result = self.request("eth_gasPrice", json!([])).await?;
        parse_quantity(&result)
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, ProviderFault> {
        let result = self.request("eth_sendTransaction", json!([tx_to_json(tx)])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| ProviderFault::Transport("transaction hash is not a string".into()))?;
        B256::from_str(text).map_err(|e| ProviderFault::Transport(format!("bad transaction hash {text}: {e}")))
    }

    async fn call(&self, tx: &TxRequest) -> Result<Bytes, ProviderFault> {
        let result = self.request("eth_call", json!([tx_to_json(tx), "latest"])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| ProviderFault::Transport("call result is not a string".into()))?;
        Bytes::from_str(text).map_err(|e| ProviderFault::Transport(format!("bad call result: {e}")))
    }

    fn subscribe(&self, session: SessionInfo) -> mpsc::Receiver<ProviderEvent> {
        let (tx, rx) = mpsc::channel(16);
        let provider = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(provider.poll_interval);
            let mut tracker = ChangeTracker::new(session);
            'poll: loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let mut events = Vec::with_capacity(2);
                match provider.accounts().await {
                    Ok(accounts) => events.extend(tracker.accounts(accounts)),
                    Err(e) => warn!("Account poll failed: {e}"),
                }
                match provider.chain_id().await {
                    Ok(chain_id) => events.extend(tracker.chain(chain_id)),
                    Err(e) => warn!("Network poll failed: {e}"),
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        break 'poll;
                    }
                }
            }
            debug!("Provider poller stopped");
        });
        rx
    }
}

/// Last account and network reported to the session, seeded from the
/// session that started polling so a change made right after connecting is
/// still reported.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChangeTracker {
    account: Option<Address>,
    chain_id: ChainId,
}

impl ChangeTracker {
    fn new(session: SessionInfo) -> Self {
        Self {
            account: Some(session.account),
            chain_id: session.chain_id,
        }
    }

    fn accounts(&mut self, accounts: Vec<Address>) -> Option<ProviderEvent> {
        let primary = accounts.first().copied();
        if primary == self.account {
            return None;
        }
        self.account = primary;
        Some(ProviderEvent::AccountsChanged(accounts))
    }

    fn chain(&mut self, chain_id: ChainId) -> Option<ProviderEvent> {
        if chain_id == self.chain_id {
            return None;
        }
        self.chain_id = chain_id;
        Some(ProviderEvent::ChainChanged(chain_id))
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

fn unwrap_reply(mut reply: Value) -> Result<Value, ProviderFault> {
    if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return Err(classify_rpc_error(code, message));
    }
    match reply.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(ProviderFault::Transport("reply has neither result nor error".into())),
    }
}

pub fn classify_rpc_error(code: i64, message: String) -> ProviderFault {
    if code == USER_REJECTED {
        ProviderFault::Rejected
    } else if code == EXECUTION_REVERTED || message.to_lowercase().contains("revert") {
        ProviderFault::Reverted(message)
    } else {
        ProviderFault::Rpc { code, message }
    }
}

/// Hex quantity (`"0x1a"`) to integer.
pub fn parse_quantity(v: &Value) -> Result<u128, ProviderFault> {
    let text = v
        .as_str()
        .ok_or_else(|| ProviderFault::Transport(format!("expected hex quantity, got {v}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| ProviderFault::Transport(format!("bad quantity {text}: {e}")))
}

fn parse_accounts(v: &Value) -> Result<Vec<Address>, ProviderFault> {
    let items = v
        .as_array()
        .ok_or_else(|| ProviderFault::Transport("accounts result is not an array".into()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| Address::from_str(s).ok())
                .ok_or_else(|| ProviderFault::Transport(format!("bad account {item}")))
        })
        .collect()
}

fn tx_to_json(tx: &TxRequest) -> Value {
    let mut obj = json!({
        "from": tx.from.to_checksum(None),
        "to": tx.to.to_checksum(None),
        "data": hex::encode_prefixed(&tx.data),
        "value": format!("0x{:x}", tx.value),
    });
    if let Some(gas) = tx.gas {
        obj["gas"] = json!(format!("0x{gas:x}"));
    }
    if let Some(price) = tx.gas_price {
        obj["gasPrice"] = json!(format!("0x{price:x}"));
    }
    obj
}
