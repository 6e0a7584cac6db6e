//! Active node health checking.
//!
//! # Responsibilities
//! - Periodically probe every node with a chain-state query
//! - Update node health state based on results (with hysteresis)
//!
//! Probes use their own short-lived connection so a saturated node can
//! still be observed.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::HealthCheckConfig;
use crate::ledger::LedgerConnection;
use crate::observability::metrics;
use crate::pool::manager::NodePool;
use crate::pool::node::Node;

pub struct HealthMonitor {
    pool: Arc<NodePool>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(pool: Arc<NodePool>, config: HealthCheckConfig) -> Self {
        Self { pool, config }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled, trusting all nodes");
            for node in self.pool.nodes() {
                node.mark_success(1);
                metrics::record_node_health(&node.name, true);
            }
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            nodes = self.pool.nodes().len(),
            "Health monitor starting"
        );

        // The first tick completes immediately, so nodes are probed at startup.
        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every node once, concurrently.
    pub async fn check_all(&self) {
        join_all(self.pool.nodes().iter().map(|node| self.check_node(node))).await;
    }

    async fn check_node(&self, node: &Arc<Node>) {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let probe = async {
            let mut conn = LedgerConnection::connect(&node.endpoint, timeout, timeout).await?;
            let height = conn.chain_state().await;
            conn.close().await;
            height
        };

        let healthy = match time::timeout(timeout * 2, probe).await {
            Ok(Ok(height)) => {
                tracing::trace!(node = %node.name, height = %height, "Probe ok");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(node = %node.name, error = %e, "Health check failed");
                false
            }
            Err(_) => {
                tracing::warn!(node = %node.name, "Health check failed: timeout");
                false
            }
        };

        if healthy {
            if node.mark_success(self.config.healthy_threshold as usize) {
                tracing::info!(node = %node.name, endpoint = %node.endpoint, "Node healthy");
            }
        } else if node.mark_failure(self.config.unhealthy_threshold as usize) {
            tracing::warn!(node = %node.name, endpoint = %node.endpoint, "Node unhealthy");
        }

        metrics::record_node_health(&node.name, node.is_available());
    }
}
