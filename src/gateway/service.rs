//! The surface transport adapters call.

use std::sync::Arc;

use crate::gateway::types::{EnqueueOutcome, EnqueueRequest, GatewayError};
use crate::ledger::PublicKey;
use crate::payments::Subscriptions;
use crate::store::{unix_now, Deposit, RequestKey, SendRequest, Store, StoreError};
use crate::sync::filter::RoiHandle;

#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn Store>,
    subscriptions: Subscriptions,
    deposits_roi: RoiHandle,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, subscriptions: Subscriptions, deposits_roi: RoiHandle) -> Self {
        Self {
            store,
            subscriptions,
            deposits_roi,
        }
    }

    /// Persist a new request as Enqueued.
    ///
    /// A repeated (service, id) pair reports `duplicate` and leaves the
    /// existing row untouched.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, GatewayError> {
        request.validate()?;

        let row = SendRequest::new(
            request.key(),
            request.kind,
            request.destination,
            request.ignore_approval,
            unix_now(),
        );
        match self.store.insert_request(&row).await {
            Ok(()) => {
                tracing::info!(request = %row.key, destination = %row.destination, kind = ?row.kind, "Request enqueued");
                Ok(EnqueueOutcome { duplicate: false })
            }
            Err(StoreError::Duplicate) => {
                tracing::info!(request = %row.key, "Duplicate request ignored");
                Ok(EnqueueOutcome { duplicate: true })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current state of a request.
    pub async fn request(&self, service: &str, request_id: &str) -> Result<Option<SendRequest>, GatewayError> {
        Ok(self.store.get_request(&RequestKey::new(service, request_id)).await?)
    }

    /// Subscribe `service` to deposits into `wallets`. Returns false if any
    /// subscription could not be persisted.
    pub async fn add_wallets(&self, service: &str, wallets: &[PublicKey]) -> bool {
        let mut persisted = Vec::with_capacity(wallets.len());
        let mut ok = true;
        for wallet in wallets {
            match self.store.add_subscription(service, wallet).await {
                Ok(_) => persisted.push(*wallet),
                Err(e) => {
                    tracing::warn!(service, wallet = %wallet, error = %e, "Failed to persist subscription");
                    ok = false;
                }
            }
        }

        let newly_watched = self.subscriptions.add(service, &persisted);
        tracing::info!(service, added = persisted.len(), newly_watched = newly_watched.len(), "Wallets subscribed");
        self.deposits_roi.add(newly_watched);
        ok
    }

    /// Unsubscribe `service` from `wallets`. A wallet left without
    /// subscribers stops being watched.
    pub async fn remove_wallets(&self, service: &str, wallets: &[PublicKey]) -> bool {
        let mut persisted = Vec::with_capacity(wallets.len());
        let mut ok = true;
        for wallet in wallets {
            match self.store.remove_subscription(service, wallet).await {
                Ok(_) => persisted.push(*wallet),
                Err(e) => {
                    tracing::warn!(service, wallet = %wallet, error = %e, "Failed to remove subscription");
                    ok = false;
                }
            }
        }

        let unwatched = self.subscriptions.remove(service, &persisted);
        tracing::info!(service, removed = persisted.len(), unwatched = unwatched.len(), "Wallets unsubscribed");
        self.deposits_roi.remove(unwatched);
        ok
    }

    /// Deposits saved for `service` into `wallet`.
    pub async fn deposits(&self, service: &str, wallet: &PublicKey) -> Result<Vec<Deposit>, GatewayError> {
        Ok(self.store.list_deposits(service, wallet).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Amount, Token};
    use crate::store::{MemoryStore, RequestStatus};
    use crate::sync::filter::{BatchConfig, RoiFilter};
    use crate::sync::TxKind;
    use std::time::Duration;

    fn gateway() -> (Gateway, Arc<MemoryStore>, RoiFilter) {
        let store = Arc::new(MemoryStore::new());
        let interest = |_: TxKind, _: bool| true;
        let (filter, roi) = RoiFilter::new(
            "deposits",
            [],
            Arc::new(interest),
            BatchConfig {
                size: 10,
                idle: Duration::from_millis(10),
            },
        );
        (Gateway::new(store.clone(), Subscriptions::new(), roi), store, filter)
    }

    #[tokio::test]
    async fn test_duplicate_enqueue() {
        let (gw, store, _filter) = gateway();
        let req = EnqueueRequest::transfer("svc", "r1", PublicKey([1; 32]), Token::Stable, Amount::whole(10));

        assert!(!gw.enqueue(req.clone()).await.unwrap().duplicate);
        let mut again = req.clone();
        again.destination = PublicKey([2; 32]);
        assert!(gw.enqueue(again).await.unwrap().duplicate);

        let rows = store.list_requests(RequestStatus::Enqueued, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].destination, PublicKey([1; 32]));
    }

    #[tokio::test]
    async fn test_validation_never_persists() {
        let (gw, store, _filter) = gateway();
        let zero = EnqueueRequest::transfer("svc", "r1", PublicKey([1; 32]), Token::Coin, Amount::ZERO);
        assert!(matches!(gw.enqueue(zero).await, Err(GatewayError::Validation(_))));
        let no_service = EnqueueRequest::approval("", "r2", PublicKey([1; 32]));
        assert!(matches!(gw.enqueue(no_service).await, Err(GatewayError::Validation(_))));
        assert!(store.list_requests(RequestStatus::Enqueued, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wallet_subscriptions_persist() {
        let (gw, store, _filter) = gateway();
        let w = PublicKey([4; 32]);
        assert!(gw.add_wallets("shop", &[w]).await);
        assert_eq!(store.list_subscriptions().await.unwrap(), vec![("shop".to_string(), w)]);
        assert!(gw.remove_wallets("shop", &[w]).await);
        assert!(store.list_subscriptions().await.unwrap().is_empty());
    }
}
