//! Integration tests for the transaction orchestrator, driven by in-memory
//! wallet and ledger fakes.
mod common;

use alloy_primitives::U256;
use alloy_sol_types::SolCall;
use std::time::Duration;

use common::*;
use scos_staking_client::backend::LedgerError;
use scos_staking_client::errors::OpError;
use scos_staking_client::models::{OperationKind, OperationStatus, PositionKey, PositionState};
use scos_staking_client::orchestrator::StakeState;
use scos_staking_client::wallet::{IStockToken, ProviderEvent, ProviderFault};

fn key() -> PositionKey {
    PositionKey::new(account(), token(), CHAIN)
}

// ---------------------------------------------------------------------------
// Stake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stake_approves_then_settles() {
    let h = harness();
    h.orch.connect().await.unwrap();

    let result = h.orch.stake(stake_intent("5")).await.unwrap();
    assert_eq!(result.tx_hash, approval_hash());
    assert_eq!(result.borrowed, dec("10000"));
    assert_eq!(result.settlement_tx.as_deref(), Some("0xsettled"));

    // Phase A: one approve(vault, 5 * 10^6) to the token.
    let sent = h.provider.sent();
    assert_eq!(sent.len(), 1);
    let call = IStockToken::approveCall::abi_decode(&sent[0].data, true).unwrap();
    assert_eq!(call.spender, vault());
    assert_eq!(call.amount, U256::from(5_000_000u64));

    // Phase B: one settlement carrying the same intent.
    assert_eq!(h.ledger.count("stake"), 1);
    let body = h.ledger.settlements.lock().unwrap()[0].clone();
    assert_eq!(body.amount, "5");
    assert_eq!(body.chain, CHAIN);
    assert_eq!(body.stock_symbol.as_deref(), Some("APPLE"));

    assert!(matches!(
        h.orch.positions().get(&key()),
        Some(PositionState::Borrowed { .. })
    ));
    assert!(matches!(*h.orch.stake_progress().borrow(), StakeState::Done(_)));
    // connect + post-stake refresh
    assert_eq!(h.ledger.count("balance"), 2);
    assert_eq!(
        h.orch.balances().snapshot_for(account()).map(|s| s.borrowed_total),
        Some(dec("250"))
    );

    let journaled = h.journal.recent(10).unwrap();
    assert_eq!(journaled.len(), 1);
    assert_eq!(journaled[0].status, OperationStatus::Completed);
    assert_eq!(journaled[0].borrowed, Some(dec("10000")));
}

#[tokio::test]
async fn failed_approval_never_reaches_backend() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.provider.estimate.lock().unwrap() = Err(ProviderFault::Reverted("ERC20: insufficient balance".into()));

    let err = h.orch.stake(stake_intent("5")).await.unwrap_err();
    assert_eq!(err.op, OperationKind::Stake);
    assert!(matches!(err.kind, OpError::ApprovalFailed(_)));
    assert!(!err.is_partial());
    assert_eq!(h.ledger.count("stake"), 0);

    assert_eq!(h.orch.positions().get(&key()), None);
    assert!(matches!(*h.orch.stake_progress().borrow(), StakeState::Aborted(_)));
    let journaled = h.journal.recent(10).unwrap();
    assert_eq!(journaled[0].status, OperationStatus::Failed);
}

#[tokio::test]
async fn wallet_rejection_during_approval_is_approval_failed() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.provider.send_result.lock().unwrap() = Err(ProviderFault::Rejected);

    let err = h.orch.stake(stake_intent("5")).await.unwrap_err();
    assert!(matches!(err.kind, OpError::ApprovalFailed(_)));
    assert_eq!(h.ledger.count("stake"), 0);
}

#[tokio::test]
async fn failed_settlement_leaves_position_pending() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.stake_result.lock().unwrap() = Err(LedgerError::Network("timed out".into()));

    let err = h.orch.stake(stake_intent("5")).await.unwrap_err();
    assert!(err.is_partial());
    assert!(!err.nothing_happened());
    match &err.kind {
        OpError::SettlementFailed { approval_tx, reason } => {
            assert_eq!(*approval_tx, approval_hash());
            assert_eq!(reason, "timed out");
        }
        other => panic!("expected SettlementFailed, got {other:?}"),
    }
    assert!(err.user_message().contains("PARTIALLY"));

    assert_eq!(
        h.orch.positions().get(&key()),
        Some(PositionState::Staking {
            approval_tx: Some(approval_hash())
        })
    );
    assert!(matches!(
        *h.orch.stake_progress().borrow(),
        StakeState::PendingReconciliation(_)
    ));

    let pending = h.orch.pending_stakes().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].approval_tx, approval_hash());
    assert_eq!(pending[0].intent.amount, dec("5"));
    assert_eq!(h.journal.pending_reconciliation().unwrap().len(), 1);
}

#[tokio::test]
async fn retry_settles_without_second_approval() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.stake_result.lock().unwrap() = Err(LedgerError::Rejected("oracle stale".into()));
    h.orch.stake(stake_intent("5")).await.unwrap_err();
    let pending = h.orch.pending_stakes().unwrap().remove(0);

    *h.ledger.stake_result.lock().unwrap() = Ok(scos_staking_client::backend::StakeReceipt {
        borrowed: dec("10000"),
        tx_hash: None,
    });
    let result = h.orch.retry_settlement(&pending).await.unwrap();
    assert_eq!(result.borrowed, dec("10000"));
    assert_eq!(h.provider.sent().len(), 1);
    assert_eq!(h.ledger.count("stake"), 2);

    let record = h.journal.get_operation(&pending.operation_id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Reconciled);
    assert!(h.orch.pending_stakes().unwrap().is_empty());
    assert!(h.orch.positions().pending().is_empty());
}

#[tokio::test]
async fn retry_of_settled_operation_is_rejected() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.stake_result.lock().unwrap() = Err(LedgerError::Network("down".into()));
    h.orch.stake(stake_intent("5")).await.unwrap_err();
    let pending = h.orch.pending_stakes().unwrap().remove(0);
    assert!(h.orch.mark_reconciled(&pending.operation_id, Some("settled by hand")).unwrap());

    let err = h.orch.retry_settlement(&pending).await.unwrap_err();
    assert!(matches!(err.kind, OpError::Validation(_)));
    assert_eq!(h.ledger.count("stake"), 1);
}

#[tokio::test]
async fn concurrent_stake_is_rejected_not_duplicated() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let gate = h.ledger.gate_stake();

    let orch = h.orch.clone();
    let first = tokio::spawn(async move { orch.stake(stake_intent("5")).await });
    let mut progress = h.orch.stake_progress();
    tokio::time::timeout(
        Duration::from_secs(1),
        progress.wait_for(|s| matches!(s, StakeState::Settling { .. })),
    )
    .await
    .expect("first stake never reached settlement")
    .unwrap();

    let second = h.orch.stake(stake_intent("5")).await.unwrap_err();
    assert_eq!(second.kind, OpError::Busy(OperationKind::Stake));
    assert!(second.nothing_happened());

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(h.ledger.count("stake"), 1);
    assert_eq!(h.provider.sent().len(), 1);

    // Guard released once the first stake finished.
    h.orch.stake(stake_intent("1")).await.unwrap();
}

#[tokio::test]
async fn disconnect_during_settlement_abandons_request() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let _gate = h.ledger.gate_stake();

    let orch = h.orch.clone();
    let first = tokio::spawn(async move { orch.stake(stake_intent("5")).await });
    let mut progress = h.orch.stake_progress();
    tokio::time::timeout(
        Duration::from_secs(1),
        progress.wait_for(|s| matches!(s, StakeState::Settling { .. })),
    )
    .await
    .expect("stake never reached settlement")
    .unwrap();

    h.orch.wallet().disconnect();
    let err = tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .expect("stake was not cancelled")
        .unwrap()
        .unwrap_err();
    match err.kind {
        OpError::SettlementFailed { reason, .. } => assert!(reason.contains("disconnected")),
        other => panic!("expected SettlementFailed, got {other:?}"),
    }
    assert_eq!(h.journal.pending_reconciliation().unwrap().len(), 1);
}

#[tokio::test]
async fn account_switch_during_settlement_cancels_it() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let gate = h.ledger.gate_stake();

    let orch = h.orch.clone();
    let first = tokio::spawn(async move { orch.stake(stake_intent("5")).await });
    let mut progress = h.orch.stake_progress();
    progress
        .wait_for(|s| matches!(s, StakeState::Settling { .. }))
        .await
        .unwrap();

    h.orch
        .wallet()
        .apply_event(ProviderEvent::AccountsChanged(vec![other_account()]));
    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_partial());
    assert!(err.to_string().contains("switched"));
    gate.notify_one();
}

#[tokio::test]
async fn dropped_stake_after_approval_stays_retryable() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let _gate = h.ledger.gate_stake();

    let orch = h.orch.clone();
    let task = tokio::spawn(async move { orch.stake(stake_intent("5")).await });
    let mut progress = h.orch.stake_progress();
    tokio::time::timeout(
        Duration::from_secs(1),
        progress.wait_for(|s| matches!(s, StakeState::Settling { .. })),
    )
    .await
    .expect("stake never reached settlement")
    .unwrap();

    // Caller gives up (or the process dies) while the backend call is open.
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let journaled = h.journal.pending_reconciliation().unwrap();
    assert_eq!(journaled.len(), 1);
    assert_eq!(journaled[0].approval_tx, Some(approval_hash()));

    let pending = h.orch.pending_stakes().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].approval_tx, approval_hash());
    let found = h.orch.find_pending(&pending[0].operation_id).unwrap();
    assert!(found.is_some());
    assert_eq!(h.orch.positions().pending().len(), 1);

    // The guard was released with the dropped task, so the retry can run.
    let result = h.orch.retry_settlement(&pending[0]).await.unwrap();
    assert_eq!(result.borrowed, dec("10000"));
    assert_eq!(h.provider.sent().len(), 1);
    let record = h.journal.get_operation(&pending[0].operation_id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Reconciled);
    assert_eq!(record.detail, None);
}

#[tokio::test]
async fn disconnect_during_approval_aborts_stake() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let _gate = h.provider.gate_send();

    let orch = h.orch.clone();
    let task = tokio::spawn(async move { orch.stake(stake_intent("5")).await });
    let mut progress = h.orch.stake_progress();
    tokio::time::timeout(
        Duration::from_secs(1),
        progress.wait_for(|s| matches!(s, StakeState::Approving)),
    )
    .await
    .expect("stake never started approval")
    .unwrap();
    // Let the task reach the wallet before pulling the session.
    tokio::task::yield_now().await;

    h.orch.wallet().disconnect();
    let err = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("approval was not cancelled")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err.kind, OpError::Cancelled(_)), "{err}");
    assert!(!err.is_partial());

    assert_eq!(h.ledger.count("stake"), 0);
    assert_eq!(h.orch.positions().get(&key()), None);
    assert!(matches!(*h.orch.stake_progress().borrow(), StakeState::Aborted(_)));
    let journaled = h.journal.recent(10).unwrap();
    assert_eq!(journaled.len(), 1);
    assert_eq!(journaled[0].status, OperationStatus::Failed);
    assert!(h.orch.pending_stakes().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stake_requires_connected_wallet() {
    let h = harness();
    let err = h.orch.stake(stake_intent("5")).await.unwrap_err();
    assert!(matches!(err.kind, OpError::Validation(_)));
    assert!(err.nothing_happened());
    assert!(h.provider.sent().is_empty());
    assert_eq!(h.ledger.calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn stake_rejects_bad_intents_before_any_io() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let calls_after_connect = h.ledger.calls.lock().unwrap().len();

    let zero = stake_intent("0");
    let mut no_vault = stake_intent("5");
    no_vault.vault_address = alloy_primitives::Address::ZERO;
    let mut unknown_chain = stake_intent("5");
    unknown_chain.chain = "Scroll".into();
    let too_precise = stake_intent("1.0000001");

    for intent in [zero, no_vault, unknown_chain, too_precise] {
        let err = h.orch.stake(intent).await.unwrap_err();
        assert!(matches!(err.kind, OpError::Validation(_)), "{err}");
    }
    assert!(h.provider.estimated.lock().unwrap().is_empty());
    assert_eq!(h.ledger.calls.lock().unwrap().len(), calls_after_connect);
}

#[tokio::test]
async fn stake_rejects_wallet_on_wrong_network() {
    let h = harness();
    h.orch.connect().await.unwrap();
    h.orch.wallet().apply_event(ProviderEvent::ChainChanged(1));

    let err = h.orch.stake(stake_intent("5")).await.unwrap_err();
    assert!(matches!(err.kind, OpError::Validation(_)));
    assert!(err.to_string().contains("Ethereum"));
}

// ---------------------------------------------------------------------------
// Buy / sell / redeem
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buy_rejection_carries_backend_reason() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.order_result.lock().unwrap() = Err(LedgerError::Rejected("insufficient SCOS".into()));

    let err = h.orch.buy(order_intent("2")).await.unwrap_err();
    assert_eq!(err.to_string(), "buy failed: order rejected: insufficient SCOS");
    assert!(h.provider.sent().is_empty());
    assert_eq!(h.journal.recent(1).unwrap()[0].status, OperationStatus::Failed);
}

#[tokio::test]
async fn sell_transport_failure_is_network_error() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.order_result.lock().unwrap() = Err(LedgerError::Network("HTTP 502 Bad Gateway".into()));

    let err = h.orch.sell(order_intent("2")).await.unwrap_err();
    assert_eq!(err.op, OperationKind::Sell);
    assert!(matches!(err.kind, OpError::NetworkError(_)));
}

#[tokio::test]
async fn buy_success_marks_position_traded() {
    let h = harness();
    h.orch.connect().await.unwrap();

    h.orch.buy(order_intent("2")).await.unwrap();
    assert_eq!(h.ledger.count("buy"), 1);
    assert!(matches!(
        h.orch.positions().get(&key()),
        Some(PositionState::Traded { .. })
    ));
    assert_eq!(h.ledger.count("balance"), 2);
}

#[tokio::test]
async fn redeem_clears_position() {
    let h = harness();
    h.orch.connect().await.unwrap();
    h.orch.stake(stake_intent("5")).await.unwrap();

    h.orch.redeem(redeem_intent()).await.unwrap();
    assert_eq!(h.orch.positions().get(&key()), Some(PositionState::Redeemed));
    assert_eq!(h.ledger.count("redeem"), 1);
}

#[tokio::test]
async fn redeem_rejection_is_distinct() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.redeem_result.lock().unwrap() = Err(LedgerError::Rejected("no active stake".into()));

    let err = h.orch.redeem(redeem_intent()).await.unwrap_err();
    assert_eq!(err.kind, OpError::RedeemRejected("no active stake".into()));
}

async fn wait_for_call(h: &Harness, call: &str) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.ledger.count(call) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("backend call never started");
}

#[tokio::test]
async fn disconnect_during_buy_cancels_order() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let _gate = h.ledger.gate("buy");

    let orch = h.orch.clone();
    let task = tokio::spawn(async move { orch.buy(order_intent("2")).await });
    wait_for_call(&h, "buy").await;

    h.orch.wallet().disconnect();
    let err = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("buy was not cancelled")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.op, OperationKind::Buy);
    assert!(matches!(err.kind, OpError::Cancelled(ref r) if r.contains("disconnected")));
    assert_eq!(h.orch.positions().get(&key()), None);
    assert_eq!(h.journal.recent(1).unwrap()[0].status, OperationStatus::Failed);
    // Only the connect-time refresh.
    assert_eq!(h.ledger.count("balance"), 1);
}

#[tokio::test]
async fn account_switch_during_redeem_cancels_it() {
    let h = harness();
    h.orch.connect().await.unwrap();
    let _gate = h.ledger.gate("redeem");

    let orch = h.orch.clone();
    let task = tokio::spawn(async move { orch.redeem(redeem_intent()).await });
    wait_for_call(&h, "redeem").await;

    h.orch
        .wallet()
        .apply_event(ProviderEvent::AccountsChanged(vec![other_account()]));
    let err = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("redeem was not cancelled")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err.kind, OpError::Cancelled(ref r) if r.contains("switched")));
    assert_ne!(h.orch.positions().get(&key()), Some(PositionState::Redeemed));

    // A fresh redeem is not blocked by the cancelled one.
    h.orch
        .wallet()
        .apply_event(ProviderEvent::AccountsChanged(vec![account()]));
    h.orch.redeem(redeem_intent()).await.unwrap();
}

#[tokio::test]
async fn balance_refresh_failure_does_not_fail_operation() {
    let h = harness();
    h.orch.connect().await.unwrap();
    *h.ledger.balance.lock().unwrap() = Err(LedgerError::Network("down".into()));

    assert!(h.orch.sell(order_intent("1")).await.is_ok());
}

// ---------------------------------------------------------------------------
// Quote / balance view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quote_uses_cached_price_and_ratio() {
    let h = harness();
    *h.ledger.prices.lock().unwrap() = Ok(vec![scos_staking_client::models::PriceEntry {
        symbol: "APPLE".into(),
        price: dec("100"),
    }]);
    assert_eq!(h.orch.quote(&token(), "140"), dec("0"));

    h.orch.prices().refresh_all().await;
    assert_eq!(h.orch.quote(&token(), "140"), dec("10000"));
    assert_eq!(h.orch.quote(&token(), "abc"), dec("0"));
    assert_eq!(h.orch.quote(&other_account(), "140"), dec("0"));
}

#[tokio::test]
async fn price_drop_flags_settled_position() {
    let h = harness();
    h.orch.prices().refresh_all().await;
    h.orch.connect().await.unwrap();
    h.orch.stake(stake_intent("5")).await.unwrap();
    assert!(h.orch.at_risk_positions().is_empty());

    // APPLE settled at 150; 25 % down is 112.5.
    *h.ledger.prices.lock().unwrap() = Ok(vec![scos_staking_client::models::PriceEntry {
        symbol: "APPLE".into(),
        price: dec("120"),
    }]);
    h.orch.prices().refresh_all().await;
    assert!(h.orch.at_risk_positions().is_empty());

    *h.ledger.prices.lock().unwrap() = Ok(vec![scos_staking_client::models::PriceEntry {
        symbol: "APPLE".into(),
        price: dec("100"),
    }]);
    h.orch.prices().refresh_all().await;
    assert_eq!(h.orch.at_risk_positions(), vec![(key(), dec("100"))]);

    let tighter = h.orch.clone().with_liquidation_drop(dec("0.5"));
    assert!(tighter.at_risk_positions().is_empty());
}

#[tokio::test]
async fn vault_stake_risk_uses_implied_entry_price() {
    let h = harness();
    assert_eq!(h.orch.stake_at_risk(&token(), dec("140"), dec("10000")), None);

    *h.ledger.prices.lock().unwrap() = Ok(vec![scos_staking_client::models::PriceEntry {
        symbol: "APPLE".into(),
        price: dec("70"),
    }]);
    h.orch.prices().refresh_all().await;
    // 140 tokens backing 10000 SCOS at ratio 1.4 were priced at 100.
    assert_eq!(h.orch.stake_at_risk(&token(), dec("140"), dec("10000")), Some(true));
    assert_eq!(h.orch.stake_at_risk(&token(), dec("140"), dec("8000")), Some(false));
    assert_eq!(h.orch.stake_at_risk(&token(), dec("0"), dec("10000")), None);
}

#[tokio::test]
async fn balance_refresh_without_account_is_noop() {
    let h = harness();
    assert_eq!(h.orch.refresh_balance().await, Ok(None));
    assert_eq!(h.ledger.count("balance"), 0);
}
