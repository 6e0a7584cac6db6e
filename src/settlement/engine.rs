//! Settlement engine.
//!
//! # Responsibilities
//! - Reconcile every held key with the chain at startup
//! - Turn Enqueued requests into signed, broadcast transactions
//! - Re-drive Posted requests that were not seen confirmed in time
//! - Map node rejections to retry or terminal failure
//!
//! # Data Flow
//! ```text
//! cycle:
//!     chain height
//!     → stale Posted (post height ≤ height − lag)  ┐
//!     → Enqueued                                   ├─▶ drive() one at a time
//!                                                  ┘
//! drive (fresh):
//!     select signer → approval check → nonce + 1 → sign
//!     → persist Posted → debit → broadcast → outcome
//! drive (retry):
//!     re-sign with recorded nonce/timestamp → persist post height
//!     → broadcast → outcome
//! ```
//!
//! # Design Decisions
//! - Requests are persisted as Posted before the first broadcast; a crash
//!   mid-broadcast leaves a row the stale sweep picks up
//! - Ed25519 signatures are deterministic, so re-signing with the recorded
//!   nonce and timestamp reproduces the recorded digest
//! - The signer table sits behind one mutex owned by the engine

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SettlementConfig;
use crate::ledger::rpc::Submitted;
use crate::ledger::{
    Amount, BlockId, LedgerApi, LedgerError, LedgerResult, PublicKey, Rejection, SignerKey, Token, WalletTag,
};
use crate::observability::metrics;
use crate::settlement::fee::FeeSchedule;
use crate::settlement::signer::{SignerState, SignerTable};
use crate::store::{unix_now, PostedInfo, RequestKind, RequestStatus, SendRequest, Store, StoreError};
use crate::sync::block::{SignedTx, TxBody};

/// Delay between reconciliation attempts for one key.
const RECONCILE_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no signer keys configured")]
    NoSigners,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,
}

/// What one pass of [`SettlementEngine::drive`] did to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Left untouched for a later cycle.
    Deferred(&'static str),
    /// Broadcast accepted (or already known); now waiting for confirmation.
    Posted,
    /// Still Posted; will be re-driven by the stale sweep.
    Pending(String),
    Failed(String),
    /// Terminal request, not touched.
    Skipped,
}

impl Step {
    fn metric(&self) -> &'static str {
        match self {
            Step::Deferred(_) => "deferred",
            Step::Posted => "posted",
            Step::Pending(_) => "pending",
            Step::Failed(_) => "failed",
            Step::Skipped => "skipped",
        }
    }

    fn progressed(&self) -> bool {
        matches!(self, Step::Posted | Step::Failed(_))
    }
}

/// Debit applied for a fresh attempt, kept to revert it.
#[derive(Debug, Clone, Copy)]
struct Debit {
    token: Token,
    total: Amount,
}

/// A request signed and ready to broadcast.
struct Prepared {
    tx: SignedTx,
    fresh: bool,
    debit: Option<Debit>,
}

pub struct SettlementEngine {
    ledger: Arc<dyn LedgerApi>,
    store: Arc<dyn Store>,
    keys: Vec<SignerKey>,
    signers: Mutex<SignerTable>,
    fees: FeeSchedule,
    config: SettlementConfig,
}

impl SettlementEngine {
    /// Fails with `NoSigners` when `keys` is empty.
    pub fn new(
        keys: Vec<SignerKey>,
        ledger: Arc<dyn LedgerApi>,
        store: Arc<dyn Store>,
        config: SettlementConfig,
    ) -> Result<Self, EngineError> {
        if keys.is_empty() {
            return Err(EngineError::NoSigners);
        }
        Ok(Self {
            ledger,
            store,
            keys,
            signers: Mutex::new(SignerTable::default()),
            fees: FeeSchedule::new(&config.fees),
            config,
        })
    }

    /// Public keys of every held signer.
    pub fn signer_keys(&self) -> Vec<PublicKey> {
        self.keys.iter().map(SignerKey::public_key).collect()
    }

    /// Load balances, tags and nonces for every key. Chain queries are
    /// retried until they succeed; a store failure is fatal.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut states = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let public = key.public_key();
            let chain = loop {
                match self.ledger.wallet_state(&public).await {
                    Ok(state) => break state,
                    Err(e) => {
                        tracing::warn!(signer = %public, error = %e, "Signer reconciliation failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(RECONCILE_RETRY) => {}
                            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        }
                    }
                }
            };
            let store_nonce = self.store.max_nonce(&public).await?;
            let state = SignerState::reconcile(key.clone(), &chain, store_nonce);
            tracing::info!(
                signer = %public,
                chain_nonce = chain.last_nonce,
                store_nonce = ?store_nonce,
                nonce = state.nonce,
                coin = %state.balance(Token::Coin),
                stable = %state.balance(Token::Stable),
                emitter = state.emitter,
                approver = state.approver,
                "Signer reconciled"
            );
            states.push(state);
        }
        *self.signers.lock().await = SignerTable::new(states);
        Ok(())
    }

    /// Reconcile, then run work cycles until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(signers = self.keys.len(), "Settlement engine starting");
        match self.reconcile(&cancel).await {
            Ok(()) => {}
            Err(EngineError::Cancelled) => return,
            Err(e) => {
                tracing::error!(error = %e, "Settlement engine could not start");
                return;
            }
        }

        let idle_min = Duration::from_secs(self.config.idle_min_secs);
        let idle_max = Duration::from_secs(self.config.idle_max_secs);
        let mut idle = idle_min;
        loop {
            let progressed = self.cycle(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            // Back off while idle, reset as soon as something moved.
            let delay = if progressed > 0 {
                idle = idle_min;
                idle_min
            } else {
                let delay = idle;
                idle = (idle * 2).min(idle_max);
                delay
            };
            tracing::debug!(progressed, delay_secs = delay.as_secs(), "Settlement cycle done");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Settlement engine stopped");
    }

    /// One work cycle. Returns how many requests changed state.
    pub async fn cycle(&self, cancel: &CancellationToken) -> usize {
        // 1. Chain height
        let height = match self.ledger.chain_height().await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "Settlement cycle skipped, chain height unavailable");
                return 0;
            }
        };

        // 2. Candidates: stale Posted first, then Enqueued
        let lag_edge = height.saturating_sub(self.config.confirmation_lag_blocks);
        let stale = self.store.list_stale_posted(lag_edge, self.config.batch_limit).await;
        let fresh = self
            .store
            .list_requests(RequestStatus::Enqueued, self.config.batch_limit)
            .await;
        let (stale, fresh) = match (stale, fresh) {
            (Ok(s), Ok(f)) => (s, f),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Settlement cycle skipped, store unavailable");
                return 0;
            }
        };
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), lag_edge = %lag_edge, "Re-driving stale requests");
        }

        // 3. Drive each independently
        let mut progressed = 0;
        for request in stale.into_iter().chain(fresh) {
            if cancel.is_cancelled() {
                break;
            }
            let key = request.key.clone();
            let step = self.drive(request, height).await;
            metrics::record_request_outcome(step.metric());
            tracing::debug!(request = %key, step = ?step, "Request driven");
            if step.progressed() {
                progressed += 1;
            }
        }
        progressed
    }

    /// Run one request through the state machine.
    pub async fn drive(&self, mut request: SendRequest, height: BlockId) -> Step {
        let prepared = match request.status {
            RequestStatus::Enqueued => self.prepare_fresh(&mut request, height).await,
            RequestStatus::Posted => self.prepare_retry(&mut request, height).await,
            RequestStatus::Confirmed | RequestStatus::Failed => return Step::Skipped,
        };
        let prepared = match prepared {
            Ok(p) => p,
            Err(step) => return step,
        };

        let result = self.ledger.add_transaction(&prepared.tx.encode()).await;
        self.settle(request, &prepared, result).await
    }

    /// Select a signer, check approval, claim a nonce, persist Posted, debit.
    async fn prepare_fresh(&self, request: &mut SendRequest, height: BlockId) -> Result<Prepared, Step> {
        // 1. Signer and body
        let (signer, body, debit) = match request.kind {
            RequestKind::Transfer { token, amount } => {
                let selection = {
                    let signers = self.signers.lock().await;
                    signers.select_for_transfer(token, amount, &self.fees)
                };
                let Some(selection) = selection else {
                    return Err(Step::Deferred("no signer can cover amount and fee"));
                };

                // 2. Approval precondition
                let waived = request.ignore_approval && selection.emitter;
                if token == Token::Stable && !waived && !self.destination_approved(&request.destination).await? {
                    return Err(Step::Deferred("destination not approved"));
                }

                let body = TxBody::Transfer {
                    recipient: request.destination,
                    token,
                    amount,
                    payload: Vec::new(),
                };
                let debit = amount.checked_add(selection.fee).map(|total| Debit { token, total });
                (selection.signer, body, debit)
            }
            RequestKind::Approve => {
                let approver = self.signers.lock().await.select_approver();
                let Some(approver) = approver else {
                    return Err(Step::Deferred("no approver signer"));
                };
                (approver, TxBody::approve(request.destination), None)
            }
        };

        // 3. Claim the nonce and sign
        let timestamp = unix_now();
        let tx = {
            let mut signers = self.signers.lock().await;
            let Some(state) = signers.get_mut(&signer) else {
                return Err(Step::Deferred("signer disappeared"));
            };
            let nonce = state.advance_nonce();
            SignedTx::sign(&state.key, nonce, timestamp, body)
        };

        // 4. Persist Posted before broadcasting
        request.status = RequestStatus::Posted;
        request.posted = Some(PostedInfo {
            signer,
            nonce: tx.nonce,
            digest: tx.digest(),
            post_height: height,
            timestamp,
        });
        if let Err(e) = self.store.update_request(request).await {
            tracing::warn!(request = %request.key, error = %e, "Failed to persist Posted, deferring");
            if let Some(state) = self.signers.lock().await.get_mut(&signer) {
                state.rollback_nonce(tx.nonce);
            }
            return Err(Step::Deferred("store unavailable"));
        }

        // 5. Debit once, now that the request is Posted
        let debit = match debit {
            Some(d) => {
                let mut signers = self.signers.lock().await;
                signers.apply_optimistic_debit(&signer, d.token, d.total).then_some(d)
            }
            None => None,
        };

        tracing::info!(
            request = %request.key,
            signer = %signer,
            nonce = tx.nonce,
            digest = %tx.digest(),
            "Request posted"
        );
        Ok(Prepared {
            tx,
            fresh: true,
            debit,
        })
    }

    /// Re-sign a Posted request with its recorded nonce and timestamp.
    async fn prepare_retry(&self, request: &mut SendRequest, height: BlockId) -> Result<Prepared, Step> {
        let Some(posted) = request.posted else {
            tracing::error!(request = %request.key, "Posted request without broadcast details");
            return Err(Step::Deferred("missing broadcast details"));
        };
        let body = match request.kind {
            RequestKind::Transfer { token, amount } => TxBody::Transfer {
                recipient: request.destination,
                token,
                amount,
                payload: Vec::new(),
            },
            RequestKind::Approve => TxBody::approve(request.destination),
        };
        let tx = {
            let signers = self.signers.lock().await;
            let Some(state) = signers.get(&posted.signer) else {
                tracing::warn!(request = %request.key, signer = %posted.signer, "Signer of posted request is not held");
                return Err(Step::Deferred("signer not held"));
            };
            SignedTx::sign(&state.key, posted.nonce, posted.timestamp, body)
        };
        if tx.digest() != posted.digest {
            tracing::error!(
                request = %request.key,
                recorded = %posted.digest,
                rebuilt = %tx.digest(),
                "Re-signed transaction does not match recorded digest"
            );
            return Err(Step::Deferred("digest mismatch"));
        }

        // Restart the confirmation lag.
        request.posted = Some(PostedInfo {
            post_height: height,
            ..posted
        });
        if let Err(e) = self.store.update_request(request).await {
            tracing::warn!(request = %request.key, error = %e, "Failed to refresh post height");
            return Err(Step::Deferred("store unavailable"));
        }

        tracing::info!(request = %request.key, nonce = posted.nonce, "Re-broadcasting stale request");
        Ok(Prepared {
            tx,
            fresh: false,
            debit: None,
        })
    }

    /// Whether `wallet` carries the Approved tag. Transport failures defer.
    async fn destination_approved(&self, wallet: &PublicKey) -> Result<bool, Step> {
        match self.ledger.wallet_state(wallet).await {
            Ok(state) => Ok(state.has_tag(WalletTag::Approved)),
            Err(e) => {
                tracing::warn!(wallet = %wallet, error = %e, "Approval check failed");
                Err(Step::Deferred("approval check failed"))
            }
        }
    }

    /// Apply the broadcast outcome.
    async fn settle(&self, mut request: SendRequest, prepared: &Prepared, result: LedgerResult<Submitted>) -> Step {
        let rejection = match result {
            Ok(_) | Err(LedgerError::Rejected(Rejection::AlreadySubmitted)) => return Step::Posted,
            Err(LedgerError::Rejected(rejection)) => rejection,
            Err(e) => {
                tracing::warn!(request = %request.key, error = %e, "Broadcast failed, will retry");
                return Step::Pending(e.to_string());
            }
        };

        match rejection {
            Rejection::WalletNotReady => {
                if prepared.fresh {
                    self.revert_fresh(prepared, false).await;
                }
            }
            Rejection::NonceBehind if prepared.fresh => {
                self.revert_fresh(prepared, true).await;
            }
            // A retry rejected as nonce-behind means an earlier copy landed.
            Rejection::NonceBehind | Rejection::NonceAhead | Rejection::AlreadySubmitted => {
                return Step::Pending(rejection.to_string());
            }
            Rejection::Other { .. } => {
                tracing::warn!(request = %request.key, rejection = %rejection, "Unclassified rejection, will retry");
                return Step::Pending(rejection.to_string());
            }
        }

        let reason = rejection.to_string();
        request.status = RequestStatus::Failed;
        request.failure_reason = Some(reason.clone());
        if let Err(e) = self.store.update_request(&request).await {
            // Still Posted in the store; the stale sweep sees the rejection again.
            tracing::warn!(request = %request.key, error = %e, "Failed to persist failure");
            return Step::Pending(reason);
        }
        tracing::warn!(request = %request.key, reason = %reason, "Request failed");
        Step::Failed(reason)
    }

    /// Undo the bookkeeping of a fresh attempt that the node refused.
    async fn revert_fresh(&self, prepared: &Prepared, resync_nonce: bool) {
        let signer = prepared.tx.sender;
        let chain_nonce = if resync_nonce {
            match self.ledger.wallet_state(&signer).await {
                Ok(state) => Some(state.last_nonce),
                Err(e) => {
                    tracing::warn!(signer = %signer, error = %e, "Nonce resync failed");
                    None
                }
            }
        } else {
            None
        };

        let mut signers = self.signers.lock().await;
        if let Some(debit) = prepared.debit {
            signers.credit_back(&signer, debit.token, debit.total);
        }
        let Some(state) = signers.get_mut(&signer) else {
            return;
        };
        match chain_nonce {
            Some(chain) if chain > state.nonce => {
                tracing::info!(signer = %signer, from = state.nonce, to = chain, "Nonce resynchronized from chain");
                state.nonce = chain;
            }
            Some(_) => {}
            None if !resync_nonce => {
                state.rollback_nonce(prepared.tx.nonce);
            }
            None => {}
        }
    }

    /// Cached state of one signer, for inspection.
    pub async fn signer_nonce(&self, signer: &PublicKey) -> Option<u64> {
        self.signers.lock().await.get(signer).map(|s| s.nonce)
    }

    pub async fn signer_balance(&self, signer: &PublicKey, token: Token) -> Option<Amount> {
        self.signers.lock().await.get(signer).map(|s| s.balance(token))
    }
}
