//! Signing keys held by the gateway.
//!
//! # Security
//! - Private keys are loaded ONLY from environment variables
//! - Keys are never logged or serialized

use ed25519_dalek::{Signer as _, SigningKey};

use crate::ledger::types::{Digest, PublicKey};

/// Environment variable holding comma separated hex Ed25519 seeds.
pub const SIGNER_KEYS_ENV_VAR: &str = "GATEWAY_SIGNER_KEYS";

/// Errors raised while loading keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    MissingEnv(&'static str),

    #[error("invalid private key at position {index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// An Ed25519 key pair able to sign ledger transactions.
#[derive(Clone)]
pub struct SignerKey {
    signing: SigningKey,
    public: PublicKey,
}

impl SignerKey {
    /// Build a key from its 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Parse a hex seed (with or without 0x prefix).
    pub fn from_hex(seed_hex: &str) -> Result<Self, String> {
        let seed_hex = seed_hex.trim();
        let seed_hex = seed_hex.strip_prefix("0x").unwrap_or(seed_hex);
        let bytes = hex::decode(seed_hex).map_err(|e| format!("invalid hex: {}", e))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "seed must be 32 bytes".to_string())?;
        Ok(Self::from_seed(seed))
    }

    /// Load every key listed in `GATEWAY_SIGNER_KEYS`.
    pub fn load_all_from_env() -> Result<Vec<Self>, KeyError> {
        let raw = std::env::var(SIGNER_KEYS_ENV_VAR)
            .map_err(|_| KeyError::MissingEnv(SIGNER_KEYS_ENV_VAR))?;
        Self::parse_list(&raw)
    }

    /// Parse a comma separated list of hex seeds.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, KeyError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(index, s)| {
                Self::from_hex(s).map_err(|reason| KeyError::Invalid { index, reason })
            })
            .collect()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign a transaction digest.
    pub fn sign_digest(&self, digest: &Digest) -> [u8; 64] {
        self.signing.sign(digest.as_slice()).to_bytes()
    }
}

impl std::fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerKey")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
