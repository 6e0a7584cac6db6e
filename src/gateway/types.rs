//! Transport-facing request and result types.

use thiserror::Error;

use crate::ledger::{Amount, PublicKey, Token};
use crate::store::{RequestKey, RequestKind, StoreError};

/// Longest accepted service name or request id.
pub const MAX_ID_LEN: usize = 128;

/// An outbound request as handed over by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub service: String,
    pub request_id: String,
    pub destination: PublicKey,
    pub kind: RequestKind,
    /// Skip the destination approval check when an emitter signs.
    pub ignore_approval: bool,
}

impl EnqueueRequest {
    pub fn transfer(
        service: impl Into<String>,
        request_id: impl Into<String>,
        destination: PublicKey,
        token: Token,
        amount: Amount,
    ) -> Self {
        Self {
            service: service.into(),
            request_id: request_id.into(),
            destination,
            kind: RequestKind::Transfer { token, amount },
            ignore_approval: false,
        }
    }

    pub fn approval(service: impl Into<String>, request_id: impl Into<String>, destination: PublicKey) -> Self {
        Self {
            service: service.into(),
            request_id: request_id.into(),
            destination,
            kind: RequestKind::Approve,
            ignore_approval: false,
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.service.clone(), self.request_id.clone())
    }

    /// Reject malformed requests before anything is persisted.
    pub fn validate(&self) -> Result<(), GatewayError> {
        check_id("service", &self.service)?;
        check_id("request_id", &self.request_id)?;
        if self.destination == PublicKey::default() {
            return Err(GatewayError::Validation("destination must not be the zero key".into()));
        }
        if let RequestKind::Transfer { amount, .. } = self.kind {
            if amount.is_zero() {
                return Err(GatewayError::Validation("amount must be greater than zero".into()));
            }
        }
        Ok(())
    }
}

fn check_id(field: &str, value: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::Validation(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(GatewayError::Validation(format!(
            "{} must be at most {} bytes",
            field, MAX_ID_LEN
        )));
    }
    Ok(())
}

/// Synchronous answer to an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The (service, id) pair was already known; nothing was written.
    pub duplicate: bool,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
