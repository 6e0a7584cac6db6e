//! Closes the loop on outbound requests.
//!
//! Receives outgoing matches for held signers and flips the Posted request
//! carrying the same (signer, digest) to Confirmed. Persistence failures are
//! retried with a fixed delay until they succeed; a match is never dropped.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::store::Store;
use crate::sync::block::TxKind;
use crate::sync::filter::Match;
use crate::sync::pipeline::MatchSink;

/// Sender-side interest: our own transfers and approvals.
pub fn interest(kind: TxKind, outgoing: bool) -> bool {
    outgoing && matches!(kind, TxKind::Transfer | TxKind::WalletTagSet)
}

pub struct Confirmer {
    store: Arc<dyn Store>,
    retry: Duration,
}

impl Confirmer {
    pub fn new(store: Arc<dyn Store>, retry: Duration) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl MatchSink for Confirmer {
    async fn accept(&self, m: Match, cancel: &CancellationToken) {
        let tx = &m.tx;
        loop {
            match self.store.confirm_posted(&tx.sender, &tx.digest, tx.block_id).await {
                Ok(Some(key)) => {
                    metrics::record_request_outcome("confirmed");
                    tracing::info!(request = %key, digest = %tx.digest, block_id = %tx.block_id, "Request confirmed");
                    return;
                }
                Ok(None) => {
                    // Not ours to track, or already confirmed.
                    tracing::debug!(sender = %tx.sender, digest = %tx.digest, "No posted request for transaction");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        digest = %tx.digest,
                        error = %e,
                        retry_ms = self.retry.as_millis() as u64,
                        "Failed to record confirmation, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}
