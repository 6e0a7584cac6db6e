//! Persistence collaborator.
//!
//! # Responsibilities
//! - Durable send requests with a one-row-per-(service, id) guarantee
//! - Deduplicated deposit rows
//! - Wallet subscriptions and resume cursors
//!
//! # Design Decisions
//! - Components depend on the [`Store`] trait, injected as `Arc<dyn Store>`
//! - The store refuses to modify Confirmed/Failed requests; only their
//!   notification bookkeeping may change
//! - Duplicate keys are reported as [`StoreError::Duplicate`], never as a
//!   generic backend failure

pub mod memory;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

use crate::ledger::{BlockId, Digest, PublicKey};

pub use memory::MemoryStore;
pub use types::{
    unix_now, Deposit, NotifyState, PostedInfo, RequestKey, RequestKind, RequestStatus, SendRequest,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key")]
    Duplicate,

    #[error("record {0} is final and cannot be modified")]
    Immutable(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // --- send requests ---

    /// Insert a new request. `Duplicate` if the key exists.
    async fn insert_request(&self, request: &SendRequest) -> StoreResult<()>;

    async fn get_request(&self, key: &RequestKey) -> StoreResult<Option<SendRequest>>;

    /// Requests in `status`, oldest first.
    async fn list_requests(&self, status: RequestStatus, limit: usize) -> StoreResult<Vec<SendRequest>>;

    /// Posted requests broadcast at or below `max_post_height`, oldest first.
    async fn list_stale_posted(&self, max_post_height: BlockId, limit: usize) -> StoreResult<Vec<SendRequest>>;

    /// Replace a request. `Immutable` if the stored row is terminal.
    async fn update_request(&self, request: &SendRequest) -> StoreResult<()>;

    /// Flip the Posted request signed by `signer` with `digest` to Confirmed.
    /// Returns the key of the confirmed request, if one matched.
    async fn confirm_posted(&self, signer: &PublicKey, digest: &Digest, block_id: BlockId) -> StoreResult<Option<RequestKey>>;

    /// Highest nonce recorded for `signer` on a request that did not fail.
    /// A failed request's nonce was either never consumed or is already
    /// reflected in the chain's last nonce.
    async fn max_nonce(&self, signer: &PublicKey) -> StoreResult<Option<u64>>;

    /// Terminal requests not yet notified whose next attempt is due.
    async fn list_unnotified(&self, now: u64, limit: usize) -> StoreResult<Vec<SendRequest>>;

    /// Replace only the notification bookkeeping.
    async fn update_notification(&self, key: &RequestKey, state: NotifyState) -> StoreResult<()>;

    // --- deposits ---

    /// `Duplicate` if (service, wallet, digest) exists.
    async fn insert_deposit(&self, deposit: &Deposit) -> StoreResult<()>;

    async fn list_deposits(&self, service: &str, wallet: &PublicKey) -> StoreResult<Vec<Deposit>>;

    // --- subscriptions ---

    /// Returns true if the subscription is new.
    async fn add_subscription(&self, service: &str, wallet: &PublicKey) -> StoreResult<bool>;

    /// Returns true if the subscription existed.
    async fn remove_subscription(&self, service: &str, wallet: &PublicKey) -> StoreResult<bool>;

    async fn list_subscriptions(&self) -> StoreResult<Vec<(String, PublicKey)>>;

    // --- cursors ---

    async fn cursor(&self, name: &str) -> StoreResult<Option<BlockId>>;

    async fn set_cursor(&self, name: &str, block_id: BlockId) -> StoreResult<()>;
}
