//! Wallet → subscribed services map.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ledger::PublicKey;

/// Which services want deposits for which wallets.
///
/// Cheap to clone; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    inner: Arc<DashMap<PublicKey, BTreeSet<String>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted (service, wallet) pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, PublicKey)>) -> Self {
        let subs = Self::new();
        for (service, wallet) in pairs {
            subs.inner.entry(wallet).or_default().insert(service);
        }
        tracing::info!(wallets = subs.inner.len(), "Loaded wallet subscriptions");
        subs
    }

    /// Subscribe `service` to `wallets`. Returns the wallets that had no
    /// subscriber before and must start being watched.
    pub fn add(&self, service: &str, wallets: &[PublicKey]) -> Vec<PublicKey> {
        let mut newly_watched = Vec::new();
        for wallet in wallets {
            let mut entry = self.inner.entry(*wallet).or_default();
            let was_empty = entry.is_empty();
            if entry.insert(service.to_string()) && was_empty {
                newly_watched.push(*wallet);
            }
        }
        newly_watched
    }

    /// Unsubscribe `service` from `wallets`. Returns the wallets whose last
    /// subscriber just left and must stop being watched.
    pub fn remove(&self, service: &str, wallets: &[PublicKey]) -> Vec<PublicKey> {
        let mut unwatched = Vec::new();
        for wallet in wallets {
            let removed = self
                .inner
                .remove_if_mut(wallet, |_, services| services.remove(service) && services.is_empty());
            if removed.is_some() {
                unwatched.push(*wallet);
            }
        }
        unwatched
    }

    /// Services subscribed to `wallet`, in name order.
    pub fn services(&self, wallet: &PublicKey) -> Vec<String> {
        self.inner
            .get(wallet)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every watched wallet.
    pub fn wallets(&self) -> Vec<PublicKey> {
        self.inner.iter().map(|r| *r.key()).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}
