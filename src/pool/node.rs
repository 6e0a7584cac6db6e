//! Ledger node abstraction.
//!
//! # Responsibilities
//! - Represent a single ledger node endpoint
//! - Bound concurrent connections with a semaphore
//! - Track load (`in_use + pending`) for least-load balancing
//! - Track health state (Unknown/Healthy/Unhealthy)
//! - Keep idle connections for reuse

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::config::NodeConfig;
use crate::ledger::LedgerConnection;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Never probed; not eligible for leases.
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// A single ledger node.
#[derive(Debug)]
pub struct Node {
    /// Name used in logs and metrics.
    pub name: String,
    /// `host:port` of the node.
    pub endpoint: String,
    /// Maximum concurrent connections allowed.
    pub max_connections: usize,

    /// One permit per connection slot.
    pub(crate) permits: Arc<Semaphore>,
    /// Callers waiting for a permit on this node.
    pending: AtomicUsize,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,

    idle: Mutex<Vec<LedgerConnection>>,
}

impl Node {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            name: config.name.clone(),
            endpoint: config.address.clone(),
            max_connections: config.max_connections,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            pending: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Connections currently leased out.
    pub fn in_use(&self) -> usize {
        self.max_connections
            .saturating_sub(self.permits.available_permits())
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Balancing key: leased plus waiting.
    pub fn load(&self) -> usize {
        self.in_use() + self.pending()
    }

    pub(crate) fn pending_guard(self: &Arc<Self>) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::Relaxed);
        PendingGuard { node: self.clone() }
    }

    // --- Idle connections ---

    fn idle_list(&self) -> MutexGuard<'_, Vec<LedgerConnection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a reusable connection, dropping any that died while idle.
    pub(crate) fn take_idle(&self) -> Option<LedgerConnection> {
        let mut idle = self.idle_list();
        while let Some(conn) = idle.pop() {
            if !conn.is_closed() {
                return Some(conn);
            }
        }
        None
    }

    pub(crate) fn put_idle(&self, conn: LedgerConnection) {
        self.idle_list().push(conn);
    }

    pub(crate) fn drain_idle(&self) -> Vec<LedgerConnection> {
        std::mem::take(&mut *self.idle_list())
    }

    pub fn idle_count(&self) -> usize {
        self.idle_list().len()
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Only nodes that passed a probe receive leases.
    pub fn is_available(&self) -> bool {
        self.health() == HealthState::Healthy
    }

    /// Report a successful probe. Returns true on a transition to Healthy.
    pub fn mark_success(&self, healthy_threshold: usize) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.health() == HealthState::Healthy {
            return false;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.state.store(HealthState::Healthy as u8, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Report a failed probe. Returns true on a transition to Unhealthy.
    pub fn mark_failure(&self, unhealthy_threshold: usize) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        if self.health() == HealthState::Unhealthy {
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// A live call failed at the transport level: stop leasing until the
    /// health monitor sees the node answer again.
    pub fn mark_unavailable(&self) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let previous = self
            .state
            .swap(HealthState::Unhealthy as u8, Ordering::Relaxed);
        previous != HealthState::Unhealthy as u8
    }
}

/// Counts a caller as pending on a node until dropped.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    node: Arc<Node>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.node.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn node(name: &str, max: usize) -> Arc<Node> {
        Arc::new(Node::new(&NodeConfig {
            name: name.to_string(),
            address: "127.0.0.1:1".to_string(),
            max_connections: max,
        }))
    }

    #[test]
    fn test_starts_unknown_and_unavailable() {
        let n = node("a", 2);
        assert_eq!(n.health(), HealthState::Unknown);
        assert!(!n.is_available());
        assert_eq!(n.load(), 0);
    }

    #[test]
    fn test_hysteresis() {
        let n = node("a", 2);
        assert!(!n.mark_success(2));
        assert!(n.mark_success(2));
        assert!(n.is_available());

        assert!(!n.mark_failure(3));
        assert!(!n.mark_failure(3));
        // A success in between resets the failure streak.
        n.mark_success(2);
        assert!(!n.mark_failure(3));
        assert!(!n.mark_failure(3));
        assert!(n.mark_failure(3));
        assert_eq!(n.health(), HealthState::Unhealthy);
    }

    #[test]
    fn test_mark_unavailable_is_immediate() {
        let n = node("a", 2);
        n.mark_success(1);
        assert!(n.mark_unavailable());
        assert!(!n.is_available());
        assert!(!n.mark_unavailable());
    }

    #[test]
    fn test_load_counts_pending_and_permits() {
        let n = node("a", 3);
        let _g1 = n.pending_guard();
        let permit = n.permits.clone().try_acquire_owned().unwrap();
        assert_eq!(n.in_use(), 1);
        assert_eq!(n.load(), 2);
        drop(permit);
        drop(_g1);
        assert_eq!(n.load(), 0);
    }
}
