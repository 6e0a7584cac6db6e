//! Node selection strategies.

use std::sync::Arc;

use crate::pool::node::Node;

/// Trait for node selection algorithms.
pub trait Balancer: Send + Sync + std::fmt::Debug {
    /// Pick a node among the available ones, or `None` if none is available.
    fn pick(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>>;
}

/// Least load selector.
/// Selects the available node with the minimum `in_use + pending`.
#[derive(Debug, Default)]
pub struct LeastLoad;

impl LeastLoad {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for LeastLoad {
    fn pick(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        // In case of tie, the first one is selected (stability)
        nodes
            .iter()
            .filter(|n| n.is_available())
            .min_by_key(|n| n.load())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::node::tests::node;

    #[test]
    fn test_least_load() {
        let lb = LeastLoad::new();
        let n1 = node("n1", 10);
        let n2 = node("n2", 10);
        n1.mark_success(1);
        n2.mark_success(1);

        // artificially load n1
        let _p1 = n1.pending_guard();
        let nodes = vec![n1.clone(), n2.clone()];
        assert_eq!(lb.pick(&nodes).unwrap().name, "n2");

        let _p2 = n2.pending_guard();
        let _p3 = n2.pending_guard();
        assert_eq!(lb.pick(&nodes).unwrap().name, "n1");
    }

    #[test]
    fn test_skips_unavailable_nodes() {
        let lb = LeastLoad::new();
        let probed = node("probed", 1);
        let fresh = node("fresh", 1);
        probed.mark_success(1);
        let _busy = probed.pending_guard();

        // `fresh` is idle but has never passed a probe.
        let nodes = vec![fresh.clone(), probed.clone()];
        assert_eq!(lb.pick(&nodes).unwrap().name, "probed");

        probed.mark_unavailable();
        assert!(lb.pick(&nodes).is_none());
    }
}
