//! Full gateway against a mock node: enqueue → post → confirm → notify.

mod common;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{eventually, key, test_config, wallet_state, MockLedger};
use ledger_gateway::gateway::EnqueueRequest;
use ledger_gateway::ledger::{Amount, Rejection, Token, WalletTag};
use ledger_gateway::lifecycle::{self, App, StartOptions};
use ledger_gateway::store::{RequestStatus, SendRequest};
use ledger_gateway::sync::block::TxBody;

const SIGNER_SEED: u8 = 7;

async fn start_gateway(ledger: &MockLedger) -> App {
    let options = StartOptions {
        backfill_from: None,
        signer_keys: vec![key(SIGNER_SEED)],
    };
    lifecycle::start(test_config(ledger), options, &CancellationToken::new())
        .await
        .expect("gateway starts")
}

async fn wait_until(app: &App, id: &str, done: impl Fn(&SendRequest) -> bool) -> Option<SendRequest> {
    let done = &done;
    eventually(Duration::from_secs(15), move || async move {
        app.gateway().request("shop", id).await.unwrap().filter(|r| done(r))
    })
    .await
}

async fn wait_for_status(app: &App, id: &str, status: RequestStatus) -> SendRequest {
    wait_until(app, id, |r| r.status == status)
        .await
        .unwrap_or_else(|| panic!("request {} never reached {:?}", id, status))
}

#[tokio::test]
async fn test_transfer_confirmed_and_notified() {
    let ledger = MockLedger::start(1).await;
    ledger.set_auto_mine(true);
    let signer = key(SIGNER_SEED).public_key();
    let customer = key(60).public_key();
    ledger.set_wallet(signer, wallet_state(100, 1_000_000, &[], 0));
    ledger.set_wallet(customer, wallet_state(0, 0, &[WalletTag::Approved], 0));

    let app = start_gateway(&ledger).await;
    let outcome = app
        .gateway()
        .enqueue(EnqueueRequest::transfer("shop", "refund-1", customer, Token::Stable, Amount::whole(10)))
        .await
        .unwrap();
    assert!(!outcome.duplicate);

    let confirmed = wait_for_status(&app, "refund-1", RequestStatus::Confirmed).await;
    let posted = confirmed.posted.expect("posted info kept");
    assert_eq!(posted.signer, signer);
    assert_eq!(posted.nonce, 1);
    assert!(confirmed.confirmed_block.is_some());

    let submitted = ledger.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].digest(), posted.digest);
    match &submitted[0].body {
        TxBody::Transfer { recipient, token, amount, .. } => {
            assert_eq!(*recipient, customer);
            assert_eq!(*token, Token::Stable);
            assert_eq!(*amount, Amount::whole(10));
        }
        other => panic!("unexpected body {:?}", other),
    }

    // The log publisher delivers on the next scan.
    let notified = wait_until(&app, "refund-1", |r| r.notify.notified).await;
    assert!(notified.is_some());

    // Same id again is reported as a duplicate and changes nothing.
    let again = app
        .gateway()
        .enqueue(EnqueueRequest::transfer("shop", "refund-1", customer, Token::Stable, Amount::whole(999)))
        .await
        .unwrap();
    assert!(again.duplicate);
    assert_eq!(ledger.submitted().len(), 1);

    let report = app.shutdown().await;
    assert_eq!(report.aborted, 0);
}

#[tokio::test]
async fn test_unapproved_destination_waits_for_tag() {
    let ledger = MockLedger::start(1).await;
    ledger.set_auto_mine(true);
    let signer = key(SIGNER_SEED).public_key();
    let stranger = key(61).public_key();
    ledger.set_wallet(signer, wallet_state(100, 1_000_000, &[], 0));

    let app = start_gateway(&ledger).await;
    app.gateway()
        .enqueue(EnqueueRequest::transfer("shop", "r-unapproved", stranger, Token::Stable, Amount::whole(5)))
        .await
        .unwrap();

    // A few engine cycles go by without a broadcast.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let waiting = app.gateway().request("shop", "r-unapproved").await.unwrap().unwrap();
    assert_eq!(waiting.status, RequestStatus::Enqueued);
    assert!(ledger.submitted().is_empty());

    ledger.set_wallet(stranger, wallet_state(0, 0, &[WalletTag::Approved], 0));
    wait_for_status(&app, "r-unapproved", RequestStatus::Confirmed).await;
    assert_eq!(ledger.submitted().len(), 1);

    app.shutdown().await;
}

#[tokio::test]
async fn test_wallet_not_ready_fails_request() {
    let ledger = MockLedger::start(1).await;
    let signer = key(SIGNER_SEED).public_key();
    let customer = key(62).public_key();
    ledger.set_wallet(signer, wallet_state(100, 0, &[], 0));
    ledger.reject_next(Rejection::CODE_WALLET_NOT_READY);

    let app = start_gateway(&ledger).await;
    app.gateway()
        .enqueue(EnqueueRequest::transfer("shop", "r-coin", customer, Token::Coin, Amount::whole(1)))
        .await
        .unwrap();

    let failed = wait_for_status(&app, "r-coin", RequestStatus::Failed).await;
    assert!(failed.failure_reason.is_some());

    // The nonce was handed back, so the next request reuses it.
    ledger.set_auto_mine(true);
    app.gateway()
        .enqueue(EnqueueRequest::transfer("shop", "r-coin-2", customer, Token::Coin, Amount::whole(1)))
        .await
        .unwrap();
    let confirmed = wait_for_status(&app, "r-coin-2", RequestStatus::Confirmed).await;
    assert_eq!(confirmed.posted.map(|p| p.nonce), Some(1));

    app.shutdown().await;
}

#[tokio::test]
async fn test_startup_without_signers_fails() {
    let ledger = MockLedger::start(1).await;
    let result = lifecycle::start(test_config(&ledger), StartOptions::default(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(lifecycle::StartupError::Engine(_))));
}
