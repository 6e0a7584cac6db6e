//! Watcher pipeline against a mock node: backfill, live follow, cursor.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{eventually, key, test_config, MockLedger};
use ledger_gateway::ledger::{Amount, BlockId, LedgerApi, PublicKey, Token};
use ledger_gateway::payments::{saver, DepositSaver, Subscriptions};
use ledger_gateway::pool::{HealthMonitor, NodePool};
use ledger_gateway::store::{MemoryStore, Store};
use ledger_gateway::sync::block::{SignedTx, TxBody};
use ledger_gateway::sync::observer::BlockObserver;
use ledger_gateway::sync::parser::{BlockParser, Feed, Origin, Progress};
use ledger_gateway::sync::pipeline::{self, PipelineSpec, StageTokens};
use tokio::sync::mpsc;

fn pay(seed: u8, nonce: u64, to: PublicKey, stable: u64) -> SignedTx {
    SignedTx::sign(
        &key(seed),
        nonce,
        1_700_000_000 + nonce,
        TxBody::Transfer {
            recipient: to,
            token: Token::Stable,
            amount: Amount::whole(stable),
            payload: b"order-1".to_vec(),
        },
    )
}

#[tokio::test]
async fn test_backfill_then_live_deposits() {
    let shop = key(40).public_key();
    let stranger = key(41).public_key();

    // Blocks 1..=3 exist before the gateway starts; block 2 pays the shop.
    let ledger = MockLedger::start(1).await;
    ledger.produce(&[pay(1, 1, shop, 25), pay(1, 2, stranger, 99)]);
    ledger.produce(&[]);

    let config = test_config(&ledger);
    let pool = Arc::new(NodePool::new(&config.nodes, config.pool.clone()));
    HealthMonitor::new(pool.clone(), config.health_check.clone())
        .run(CancellationToken::new())
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_cursor("deposits", BlockId::from_u64(1)).await.unwrap();
    store.add_subscription("shop", &shop).await.unwrap();
    let subscriptions = Subscriptions::from_pairs(store.list_subscriptions().await.unwrap());

    let tip = pool.chain_height().await.unwrap();
    assert_eq!(tip, BlockId::from_u64(3));

    let tokens = StageTokens::default();
    let running = pipeline::spawn(
        PipelineSpec {
            name: "deposits",
            interest: Arc::new(saver::interest),
            sink: Arc::new(DepositSaver::new(store.clone(), subscriptions.clone(), Duration::from_millis(50))),
            wallets: subscriptions.wallets(),
        },
        pool.clone(),
        store.clone(),
        &config.sync,
        tip,
        None,
        &tokens,
    )
    .await
    .unwrap();

    // Backfilled deposit from block 2.
    let backfilled = eventually(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            let rows = store.list_deposits("shop", &shop).await.unwrap();
            (!rows.is_empty()).then_some(rows)
        }
    })
    .await
    .expect("backfilled deposit");
    assert_eq!(backfilled.len(), 1);
    assert_eq!(backfilled[0].block_id, BlockId::from_u64(2));
    assert_eq!(backfilled[0].stable, Amount::whole(25));
    assert_eq!(backfilled[0].payload.as_deref(), Some(hex::encode(b"order-1").as_str()));

    // A live block after the observer subscribed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let live_block = ledger.produce(&[pay(2, 1, shop, 7)]);
    let rows = eventually(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            let rows = store.list_deposits("shop", &shop).await.unwrap();
            (rows.len() == 2).then_some(rows)
        }
    })
    .await
    .expect("live deposit");
    assert!(rows.iter().any(|d| d.block_id == live_block && d.stable == Amount::whole(7)));

    // Cursor follows the highest block handed to the sink.
    let cursor = eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            let cursor = store.cursor("deposits").await.unwrap();
            (cursor == Some(live_block)).then_some(cursor)
        }
    })
    .await;
    assert_eq!(cursor, Some(Some(live_block)));

    // Nothing for wallets nobody subscribed to.
    assert!(store.list_deposits("shop", &stranger).await.unwrap().is_empty());

    tokens.sink.cancel();
    tokens.filter.cancel();
    tokens.producers.cancel();
    running.sink.await.unwrap();
    running.filter.await.unwrap();
    for producer in running.producers {
        producer.await.unwrap();
    }
    pool.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_wallet_added_at_runtime_is_watched() {
    let shop = key(50).public_key();
    let ledger = MockLedger::start(1).await;
    let config = test_config(&ledger);
    let pool = Arc::new(NodePool::new(&config.nodes, config.pool.clone()));
    HealthMonitor::new(pool.clone(), config.health_check.clone())
        .run(CancellationToken::new())
        .await;

    let store = Arc::new(MemoryStore::new());
    let subscriptions = Subscriptions::new();
    let tokens = StageTokens::default();
    let running = pipeline::spawn(
        PipelineSpec {
            name: "deposits",
            interest: Arc::new(saver::interest),
            sink: Arc::new(DepositSaver::new(store.clone(), subscriptions.clone(), Duration::from_millis(50))),
            wallets: Vec::new(),
        },
        pool.clone(),
        store.clone(),
        &config.sync,
        ledger.tip(),
        None,
        &tokens,
    )
    .await
    .unwrap();

    // Subscribe the way the gateway does: map first, then the filter.
    store.add_subscription("shop", &shop).await.unwrap();
    let newly = subscriptions.add("shop", &[shop]);
    running.roi.add(newly);

    tokio::time::sleep(Duration::from_millis(200)).await;
    ledger.produce(&[pay(3, 1, shop, 3)]);

    let rows = eventually(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            let rows = store.list_deposits("shop", &shop).await.unwrap();
            (!rows.is_empty()).then_some(rows)
        }
    })
    .await
    .expect("deposit for wallet added at runtime");
    assert_eq!(rows[0].stable, Amount::whole(3));

    tokens.producers.cancel();
    tokens.filter.cancel();
    tokens.sink.cancel();
    pool.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_silent_node_triggers_reconnect_and_catch_up() {
    let ledger = MockLedger::start(1).await;
    let mut config = test_config(&ledger);
    config.sync.idle_watchdog_secs = 1;
    let pool = Arc::new(NodePool::new(&config.nodes, config.pool.clone()));
    HealthMonitor::new(pool.clone(), config.health_check.clone())
        .run(CancellationToken::new())
        .await;

    let (feed_tx, mut feed_rx) = mpsc::channel(64);
    let parser = BlockParser::new(pool.clone(), Origin::Live, feed_tx);
    let observer = BlockObserver::new(pool.clone(), parser, ledger.tip().next(), config.sync.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(observer.run(cancel.clone()));

    let node = &ledger;
    let subscribed = eventually(Duration::from_secs(5), move || async move { (node.subscriptions() == 1).then_some(()) }).await;
    assert!(subscribed.is_some());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // No event reaches the observer for this block; only a fresh session finds it.
    let hidden = ledger.produce_silently(&[]);

    // Watchdog (1 s) tears the session down, backoff (1 s) precedes a new one.
    let resubscribed = eventually(Duration::from_secs(10), move || async move { (node.subscriptions() >= 2).then_some(()) }).await;
    assert!(resubscribed.is_some(), "observer never reconnected");

    let progress = tokio::time::timeout(Duration::from_secs(5), feed_rx.recv())
        .await
        .expect("caught up after reconnect");
    assert_eq!(
        progress,
        Some(Feed::Progress(Progress {
            origin: Origin::Live,
            block_id: hidden,
        }))
    );

    cancel.cancel();
    task.await.unwrap();
    pool.close(Duration::from_secs(1)).await;
}
