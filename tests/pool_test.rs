//! Connection pool behaviour against a live mock node.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{test_config, MockLedger};
use ledger_gateway::ledger::{BlockId, LedgerApi, LedgerError};
use ledger_gateway::pool::{HealthMonitor, NodePool};

async fn trusted_pool(ledger: &MockLedger, max_connections: usize) -> Arc<NodePool> {
    let mut config = test_config(ledger);
    config.nodes[0].max_connections = max_connections;
    let pool = Arc::new(NodePool::new(&config.nodes, config.pool.clone()));
    // Disabled health checks trust every node and return immediately.
    HealthMonitor::new(pool.clone(), config.health_check.clone())
        .run(CancellationToken::new())
        .await;
    pool
}

#[tokio::test]
async fn test_queries_through_pool() {
    let ledger = MockLedger::start(3).await;
    let pool = trusted_pool(&ledger, 2).await;

    assert_eq!(pool.chain_height().await.unwrap(), BlockId::from_u64(3));
    let raw = pool.block_by_id(&BlockId::from_u64(2)).await.unwrap();
    assert!(!raw.is_empty());
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test]
async fn test_lease_times_out_when_node_saturated() {
    let ledger = MockLedger::start(1).await;
    let pool = trusted_pool(&ledger, 1).await;

    let held = pool.lease(Duration::from_secs(1)).await.unwrap();
    let second = pool.lease(Duration::from_millis(100)).await;
    assert!(matches!(second, Err(LedgerError::PoolExhausted(_))));

    // Released connections are reused.
    drop(held);
    let mut again = pool.lease(Duration::from_secs(1)).await.unwrap();
    assert_eq!(again.chain_state().await.unwrap(), BlockId::from_u64(1));
}

#[tokio::test]
async fn test_unknown_block_is_node_error() {
    let ledger = MockLedger::start(1).await;
    let pool = trusted_pool(&ledger, 1).await;

    let result = pool.block_by_id(&BlockId::from_u64(99)).await;
    assert!(matches!(result, Err(LedgerError::Node { code: 404, .. })));
    // The connection survives a node-level error.
    assert_eq!(pool.chain_height().await.unwrap(), BlockId::from_u64(1));
}

#[tokio::test]
async fn test_close_refuses_new_leases() {
    let ledger = MockLedger::start(1).await;
    let pool = trusted_pool(&ledger, 2).await;

    let lease = pool.lease(Duration::from_secs(1)).await.unwrap();
    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close(Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        pool.lease(Duration::from_millis(100)).await,
        Err(LedgerError::PoolClosed)
    ));

    drop(lease);
    closer.await.unwrap();
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test]
async fn test_health_probe_marks_node_available() {
    let ledger = MockLedger::start(1).await;
    let config = test_config(&ledger);
    let pool = Arc::new(NodePool::new(&config.nodes, config.pool.clone()));

    // Nothing probed yet, nothing leasable.
    assert!(matches!(
        pool.lease(Duration::from_millis(50)).await,
        Err(LedgerError::PoolExhausted(_))
    ));

    let mut health = config.health_check.clone();
    health.enabled = true;
    health.healthy_threshold = 1;
    HealthMonitor::new(pool.clone(), health).check_all().await;
    assert!(pool.lease(Duration::from_secs(1)).await.is_ok());
}
