//! Outcome delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::ledger::{BlockId, Digest, PublicKey};
use crate::store::{RequestStatus, SendRequest};

/// Terminal outcome of a request, as delivered to the owning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub service: String,
    pub request_id: String,
    pub status: RequestStatus,
    pub destination: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Notification {
    pub fn from_request(request: &SendRequest) -> Self {
        Self {
            service: request.key.service.clone(),
            request_id: request.key.request_id.clone(),
            status: request.status,
            destination: request.destination,
            digest: request.posted.map(|p| p.digest),
            block_id: request.confirmed_block,
            reason: request.failure_reason.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("receiver answered with status {0}")]
    Status(u16),
}

/// Delivers outcomes to the transport side.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes outcomes to the log. Useful when no receiver is configured.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, n: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            service = %n.service,
            request_id = %n.request_id,
            status = %n.status,
            digest = ?n.digest.map(|d| d.to_string()),
            reason = ?n.reason,
            "Request outcome"
        );
        Ok(())
    }
}

/// POSTs each outcome as JSON.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, n: &Notification) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}
