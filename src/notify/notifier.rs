//! Delivery loop for terminal request outcomes.
//!
//! # Responsibilities
//! - Scan for Confirmed/Failed requests not yet notified whose next attempt
//!   is due
//! - Publish each one and record the attempt
//! - Space failed attempts with exponential backoff and jitter
//!
//! # Design Decisions
//! - Only notification bookkeeping is written; the request itself is final
//! - After `max_attempts` failures a request is parked (next attempt never
//!   comes due) and logged

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::NotifyConfig;
use crate::notify::publisher::{Notification, Publisher};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::store::{unix_now, NotifyState, SendRequest, Store};

/// Requests loaded per scan.
const SCAN_LIMIT: usize = 100;

/// `next_attempt` of a request that gave up.
pub const PARKED: u64 = u64::MAX;

pub struct Notifier {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>, config: NotifyConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.config.scan_interval_secs, "Notifier starting");
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            let delivered = self.scan(unix_now(), &cancel).await;
            if delivered > 0 {
                tracing::debug!(delivered, "Notifications delivered");
            }
        }
        tracing::info!("Notifier stopped");
    }

    /// Attempt every due notification once. Returns how many were delivered.
    pub async fn scan(&self, now: u64, cancel: &CancellationToken) -> usize {
        let due = match self.store.list_unnotified(now, SCAN_LIMIT).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "Notifier scan failed");
                return 0;
            }
        };

        let mut delivered = 0;
        for request in due {
            if cancel.is_cancelled() {
                break;
            }
            if self.attempt(&request, now).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn attempt(&self, request: &SendRequest, now: u64) -> bool {
        let mut state = request.notify;
        state.first_attempt.get_or_insert(now);
        state.attempts += 1;

        let result = self.publisher.publish(&Notification::from_request(request)).await;
        let delivered = result.is_ok();
        match result {
            Ok(()) => {
                metrics::record_notification("delivered");
                state.notified = true;
                state.next_attempt = None;
            }
            Err(e) if state.attempts >= self.config.max_attempts => {
                metrics::record_notification("abandoned");
                tracing::error!(request = %request.key, attempts = state.attempts, error = %e, "Giving up on notification");
                state.next_attempt = Some(PARKED);
            }
            Err(e) => {
                metrics::record_notification("retry");
                let delay = calculate_backoff(state.attempts, self.config.base_delay_ms, self.config.max_delay_ms);
                let next = now.saturating_add(delay.as_secs().max(1));
                tracing::warn!(
                    request = %request.key,
                    attempts = state.attempts,
                    next_attempt = next,
                    error = %e,
                    "Notification failed"
                );
                state.next_attempt = Some(next);
            }
        }

        if let Err(e) = self.store.update_notification(&request.key, state).await {
            // Bookkeeping lost; the request is delivered again next scan.
            tracing::warn!(request = %request.key, error = %e, "Failed to record notification attempt");
        }
        delivered
    }
}

/// Whether delivery was abandoned.
pub fn is_parked(state: &NotifyState) -> bool {
    state.next_attempt == Some(PARKED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Amount, PublicKey, Token};
    use crate::notify::publisher::NotifyError;
    use crate::store::{MemoryStore, RequestKey, RequestKind, RequestStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `fail` deliveries.
    struct Flaky {
        fail: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for Flaky {
        async fn publish(&self, _n: &Notification) -> Result<(), NotifyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail {
                Err(NotifyError::Status(503))
            } else {
                Ok(())
            }
        }
    }

    async fn terminal_request(store: &MemoryStore, id: &str) -> RequestKey {
        let mut r = SendRequest::new(
            RequestKey::new("svc", id),
            RequestKind::Transfer {
                token: Token::Coin,
                amount: Amount::whole(1),
            },
            PublicKey([1; 32]),
            false,
            0,
        );
        store.insert_request(&r).await.unwrap();
        r.status = RequestStatus::Failed;
        store.update_request(&r).await.unwrap();
        r.key
    }

    fn config(max_attempts: u32) -> NotifyConfig {
        NotifyConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_then_deliver() {
        let store = Arc::new(MemoryStore::new());
        let key = terminal_request(&store, "r1").await;
        let publisher = Arc::new(Flaky {
            fail: 1,
            calls: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(store.clone(), publisher.clone(), config(5));
        let cancel = CancellationToken::new();

        assert_eq!(notifier.scan(1_000, &cancel).await, 0);
        let state = store.get_request(&key).await.unwrap().unwrap().notify;
        assert_eq!(state.attempts, 1);
        assert_eq!(state.first_attempt, Some(1_000));
        let next = state.next_attempt.unwrap();
        assert!(next > 1_000);

        // Not due yet.
        assert_eq!(notifier.scan(next - 1, &cancel).await, 0);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        assert_eq!(notifier.scan(next, &cancel).await, 1);
        let state = store.get_request(&key).await.unwrap().unwrap().notify;
        assert!(state.notified);
        assert_eq!(state.attempts, 2);
        assert_eq!(state.first_attempt, Some(1_000));

        assert_eq!(notifier.scan(u64::MAX - 1, &cancel).await, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = Arc::new(MemoryStore::new());
        let key = terminal_request(&store, "r1").await;
        let publisher = Arc::new(Flaky {
            fail: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(store.clone(), publisher, config(1));

        notifier.scan(10, &CancellationToken::new()).await;
        let state = store.get_request(&key).await.unwrap().unwrap().notify;
        assert!(is_parked(&state));
        assert!(!state.notified);
    }

    #[tokio::test]
    async fn test_non_terminal_requests_not_notified() {
        let store = Arc::new(MemoryStore::new());
        let r = SendRequest::new(RequestKey::new("svc", "open"), RequestKind::Approve, PublicKey([1; 32]), false, 0);
        store.insert_request(&r).await.unwrap();
        let publisher = Arc::new(Flaky {
            fail: 0,
            calls: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(store, publisher.clone(), config(3));
        assert_eq!(notifier.scan(10, &CancellationToken::new()).await, 0);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }
}
