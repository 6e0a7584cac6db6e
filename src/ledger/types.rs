//! Ledger value types and error definitions.

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional decimal digits carried by every token amount.
pub const AMOUNT_DECIMALS: usize = 18;

/// Content hash identifying a transaction.
pub type Digest = B256;

/// One whole token expressed in base units (10^18).
pub fn unit() -> U256 {
    U256::from(1_000_000_000_000_000_000u64)
}

/// Block height on the ledger.
///
/// 256-bit on the wire, decimal string in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockId(pub U256);

impl BlockId {
    pub const ZERO: BlockId = BlockId(U256::ZERO);

    pub fn from_u64(value: u64) -> Self {
        Self(U256::from(value))
    }

    /// The block immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(U256::from(1u8)))
    }

    /// The block immediately before this one, or `None` at genesis.
    pub fn prev(&self) -> Option<Self> {
        self.0.checked_sub(U256::from(1u8)).map(Self)
    }

    /// Height minus `blocks`, floored at zero.
    pub fn saturating_sub(&self, blocks: u64) -> Self {
        Self(self.0.saturating_sub(U256::from(blocks)))
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(U256::from_be_bytes(bytes))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str_radix(s.trim(), 10)
            .map(Self)
            .map_err(|e| format!("invalid block id '{}': {}", s, e))
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ed25519 public key identifying a wallet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| format!("invalid public key hex: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "public key must be 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The two token kinds the ledger carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    /// Native coin. Flat transfer fee, no destination restrictions.
    Coin,
    /// Restricted stable token. Tiered fee, destination must be approved.
    Stable,
}

impl Token {
    pub fn wire_id(&self) -> u8 {
        match self {
            Token::Coin => 0,
            Token::Stable => 1,
        }
    }

    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0 => Some(Token::Coin),
            1 => Some(Token::Stable),
            _ => None,
        }
    }

    /// The token whose balance drives this token's fee tier.
    pub fn other(&self) -> Self {
        match self {
            Token::Coin => Token::Stable,
            Token::Stable => Token::Coin,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Coin => f.write_str("coin"),
            Token::Stable => f.write_str("stable"),
        }
    }
}

impl FromStr for Token {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coin" => Ok(Token::Coin),
            "stable" => Ok(Token::Stable),
            other => Err(format!("unknown token '{}'", other)),
        }
    }
}

/// Fixed-point token amount with 18 fractional digits, stored in base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn from_units(units: U256) -> Self {
        Self(units)
    }

    /// Whole tokens, e.g. `Amount::whole(10)` is 10.000000000000000000.
    pub fn whole(tokens: u64) -> Self {
        Self(U256::from(tokens) * unit())
    }

    pub fn units(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_add(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let int = self.0 / unit();
        let frac = self.0 % unit();
        if frac.is_zero() {
            return write!(f, "{}", int);
        }
        let frac = format!("{:0>width$}", frac.to_string(), width = AMOUNT_DECIMALS);
        write!(f, "{}.{}", int, frac.trim_end_matches('0'))
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err("empty amount".to_string());
        }
        if frac_part.len() > AMOUNT_DECIMALS {
            return Err(format!("amount '{}' has more than {} decimals", s, AMOUNT_DECIMALS));
        }
        let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if !all_digits(int_part) || !all_digits(frac_part) {
            return Err(format!("invalid amount '{}'", s));
        }
        let int = if int_part.is_empty() {
            U256::ZERO
        } else {
            U256::from_str_radix(int_part, 10).map_err(|e| e.to_string())?
        };
        let frac = if frac_part.is_empty() {
            U256::ZERO
        } else {
            let padded = format!("{:0<width$}", frac_part, width = AMOUNT_DECIMALS);
            U256::from_str_radix(&padded, 10).map_err(|e| e.to_string())?
        };
        int.checked_mul(unit())
            .and_then(|v| v.checked_add(frac))
            .map(Amount)
            .ok_or_else(|| format!("amount '{}' overflows", s))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Role and approval tags a wallet can carry on chain.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletTag {
    /// Destination is approved to receive the stable token.
    Approved = 1,
    /// Unlimited token source.
    Emitter = 2,
    /// May approve destination wallets.
    Approver = 3,
}

impl WalletTag {
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(WalletTag::Approved),
            2 => Some(WalletTag::Emitter),
            3 => Some(WalletTag::Approver),
            _ => None,
        }
    }
}

/// Structured rejection reported by a node for `add_transaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The identical transaction is already in the pool or chain.
    AlreadySubmitted,
    /// Sender wallet cannot transact yet.
    WalletNotReady,
    /// Nonce is beyond the next expected one; the node will hold it.
    NonceAhead,
    /// Nonce was already used.
    NonceBehind,
    /// Any code this gateway does not classify.
    Other { code: i64, message: String },
}

impl Rejection {
    pub const CODE_ALREADY_SUBMITTED: i64 = 101;
    pub const CODE_WALLET_NOT_READY: i64 = 102;
    pub const CODE_NONCE_AHEAD: i64 = 103;
    pub const CODE_NONCE_BEHIND: i64 = 104;

    pub fn from_code(code: i64, message: &str) -> Self {
        match code {
            Self::CODE_ALREADY_SUBMITTED => Rejection::AlreadySubmitted,
            Self::CODE_WALLET_NOT_READY => Rejection::WalletNotReady,
            Self::CODE_NONCE_AHEAD => Rejection::NonceAhead,
            Self::CODE_NONCE_BEHIND => Rejection::NonceBehind,
            _ => Rejection::Other {
                code,
                message: message.to_string(),
            },
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Rejection::AlreadySubmitted => Self::CODE_ALREADY_SUBMITTED,
            Rejection::WalletNotReady => Self::CODE_WALLET_NOT_READY,
            Rejection::NonceAhead => Self::CODE_NONCE_AHEAD,
            Rejection::NonceBehind => Self::CODE_NONCE_BEHIND,
            Rejection::Other { code, .. } => *code,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AlreadySubmitted => f.write_str("transaction already submitted"),
            Rejection::WalletNotReady => f.write_str("wallet not ready"),
            Rejection::NonceAhead => f.write_str("nonce ahead of pool"),
            Rejection::NonceBehind => f.write_str("nonce behind or duplicate"),
            Rejection::Other { code, message } => write!(f, "code {}: {}", code, message),
        }
    }
}

/// Errors that can occur while talking to ledger nodes.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Network or RPC transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request did not get a response in time.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// The node sent something we could not decode.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The node rejected a submitted transaction.
    #[error("transaction rejected: {0}")]
    Rejected(Rejection),

    /// The node returned an error for a non-submission call.
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    /// No connection became free before the lease deadline.
    #[error("connection pool exhausted after {0:?}")]
    PoolExhausted(std::time::Duration),

    /// The pool is shutting down.
    #[error("connection pool closed")]
    PoolClosed,
}

impl LedgerError {
    /// Transport-class failures are always retried locally.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport(_) | LedgerError::Timeout(_) | LedgerError::PoolExhausted(_)
        )
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Transport(e.to_string())
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
