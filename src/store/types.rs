//! Persisted records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::{Amount, BlockId, Digest, PublicKey, Token};

/// Unique identity of a send request: the calling service plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub service: String,
    pub request_id: String,
}

impl RequestKey {
    pub fn new(service: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            request_id: request_id.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.request_id)
    }
}

/// What a request asks the gateway to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    /// Send `amount` of `token` to the destination.
    Transfer { token: Token, amount: Amount },
    /// Approve the destination for the restricted token.
    Approve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Enqueued,
    Posted,
    Confirmed,
    Failed,
}

impl RequestStatus {
    /// Confirmed and Failed rows never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Confirmed | RequestStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Enqueued => "enqueued",
            RequestStatus::Posted => "posted",
            RequestStatus::Confirmed => "confirmed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast details recorded before the first broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedInfo {
    pub signer: PublicKey,
    pub nonce: u64,
    pub digest: Digest,
    /// Chain height when the request was (last) broadcast.
    pub post_height: BlockId,
    /// Signing timestamp; re-signing with it reproduces the same digest.
    pub timestamp: u64,
}

/// Notification bookkeeping (unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyState {
    pub first_attempt: Option<u64>,
    pub next_attempt: Option<u64>,
    pub attempts: u32,
    pub notified: bool,
}

/// An outbound request and its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub key: RequestKey,
    pub kind: RequestKind,
    pub destination: PublicKey,
    pub status: RequestStatus,
    /// Skip the destination approval check (honored for emitters only).
    #[serde(default)]
    pub ignore_approval: bool,
    #[serde(default)]
    pub posted: Option<PostedInfo>,
    #[serde(default)]
    pub confirmed_block: Option<BlockId>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
    #[serde(default)]
    pub notify: NotifyState,
}

impl SendRequest {
    pub fn new(key: RequestKey, kind: RequestKind, destination: PublicKey, ignore_approval: bool, created_at: u64) -> Self {
        Self {
            key,
            kind,
            destination,
            status: RequestStatus::Enqueued,
            ignore_approval,
            posted: None,
            confirmed_block: None,
            failure_reason: None,
            created_at,
            notify: NotifyState::default(),
        }
    }
}

/// An incoming payment to a subscribed wallet, one row per subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub service: String,
    pub wallet: PublicKey,
    pub digest: Digest,
    pub block_id: BlockId,
    pub sender: PublicKey,
    pub coin: Amount,
    pub stable: Amount,
    /// Hex-encoded payload, if any.
    #[serde(default)]
    pub payload: Option<String>,
    pub timestamp: u64,
}

impl Deposit {
    /// Deduplication key.
    pub fn key(&self) -> (String, PublicKey, Digest) {
        (self.service.clone(), self.wallet, self.digest)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
