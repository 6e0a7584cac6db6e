//! Persists incoming payments to subscribed wallets.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ledger::Token;
use crate::observability::metrics;
use crate::payments::subscriptions::Subscriptions;
use crate::store::{Deposit, Store, StoreError};
use crate::sync::block::TxKind;
use crate::sync::filter::Match;
use crate::sync::pipeline::MatchSink;

/// Watcher-side interest: transfers into watched wallets.
pub fn interest(kind: TxKind, outgoing: bool) -> bool {
    !outgoing && kind == TxKind::Transfer
}

/// Build the deposit row a service receives for `m`.
pub fn deposit_for(service: &str, m: &Match) -> Deposit {
    let tx = &m.tx;
    Deposit {
        service: service.to_string(),
        wallet: m.wallet,
        digest: tx.digest,
        block_id: tx.block_id,
        sender: tx.sender,
        coin: tx.amounts.get(Token::Coin),
        stable: tx.amounts.get(Token::Stable),
        payload: tx.payload.as_ref().map(hex::encode),
        timestamp: tx.timestamp,
    }
}

pub struct DepositSaver {
    store: Arc<dyn Store>,
    subscriptions: Subscriptions,
    retry: Duration,
}

impl DepositSaver {
    pub fn new(store: Arc<dyn Store>, subscriptions: Subscriptions, retry: Duration) -> Self {
        Self {
            store,
            subscriptions,
            retry,
        }
    }

    /// Insert one row, retrying backend failures. Returns false if cancelled.
    async fn save(&self, deposit: &Deposit, cancel: &CancellationToken) -> bool {
        loop {
            match self.store.insert_deposit(deposit).await {
                Ok(()) => {
                    metrics::record_deposit_saved();
                    tracing::info!(
                        service = %deposit.service,
                        wallet = %deposit.wallet,
                        digest = %deposit.digest,
                        coin = %deposit.coin,
                        stable = %deposit.stable,
                        "Deposit saved"
                    );
                    return true;
                }
                Err(StoreError::Duplicate) => {
                    tracing::debug!(service = %deposit.service, digest = %deposit.digest, "Deposit already saved");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(digest = %deposit.digest, error = %e, "Failed to save deposit, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MatchSink for DepositSaver {
    async fn accept(&self, m: Match, cancel: &CancellationToken) {
        let services = self.subscriptions.services(&m.wallet);
        if services.is_empty() {
            // Unsubscribed after the filter matched.
            tracing::debug!(wallet = %m.wallet, "Match for wallet without subscribers");
            return;
        }
        for service in services {
            if !self.save(&deposit_for(&service, &m), cancel).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Amount, BlockId, PublicKey};
    use crate::store::MemoryStore;
    use crate::sync::block::Transaction;
    use crate::sync::parser::tests::transfer;

    fn incoming(to: PublicKey, nonce: u64) -> Match {
        Match {
            tx: Transaction::normalize(&transfer(1, nonce, to), BlockId::from_u64(8)),
            wallet: to,
            outgoing: false,
        }
    }

    #[test]
    fn test_interest() {
        assert!(interest(TxKind::Transfer, false));
        assert!(!interest(TxKind::Transfer, true));
        assert!(!interest(TxKind::DistributionFee, false));
    }

    #[tokio::test]
    async fn test_one_row_per_subscription_deduplicated() {
        let wallet = PublicKey([2; 32]);
        let store = Arc::new(MemoryStore::new());
        let subs = Subscriptions::from_pairs([("shop".to_string(), wallet), ("bank".to_string(), wallet)]);
        let saver = DepositSaver::new(store.clone(), subs, Duration::from_millis(10));

        let m = incoming(wallet, 1);
        saver.accept(m.clone(), &CancellationToken::new()).await;
        saver.accept(m, &CancellationToken::new()).await;

        let shop = store.list_deposits("shop", &wallet).await.unwrap();
        let bank = store.list_deposits("bank", &wallet).await.unwrap();
        assert_eq!(shop.len(), 1);
        assert_eq!(bank.len(), 1);
        assert_eq!(shop[0].stable, Amount::whole(5));
        assert_eq!(shop[0].coin, Amount::ZERO);
        assert_eq!(shop[0].block_id, BlockId::from_u64(8));
    }

    #[tokio::test]
    async fn test_unsubscribed_wallet_ignored() {
        let wallet = PublicKey([2; 32]);
        let store = Arc::new(MemoryStore::new());
        let saver = DepositSaver::new(store.clone(), Subscriptions::new(), Duration::from_millis(10));
        saver.accept(incoming(wallet, 1), &CancellationToken::new()).await;
        assert!(store.list_deposits("shop", &wallet).await.unwrap().is_empty());
    }
}
