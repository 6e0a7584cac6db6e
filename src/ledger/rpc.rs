//! Ledger RPC message shapes.
//!
//! Requests carry a method name and a numeric id; responses echo both.
//! Unsolicited pushes carry a method name and params but no id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::ledger::types::{Amount, BlockId, Digest, Token, WalletTag};

pub const METHOD_CHAIN_STATE: &str = "chain_state";
pub const METHOD_BLOCK_BY_ID: &str = "block_by_id";
pub const METHOD_WALLET_STATE: &str = "wallet_state";
pub const METHOD_ADD_TRANSACTION: &str = "add_transaction";
pub const METHOD_SUBSCRIBE: &str = "subscribe";
pub const EVENT_BLOCKS_SYNCHRONIZED: &str = "blocks_synchronized";

/// Outgoing request frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub method: String,
    pub id: u64,
    #[serde(default)]
    pub params: Value,
}

/// Error object attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Any frame a node can send us.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incoming {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Incoming {
    /// Frames without an id are push events.
    pub fn is_event(&self) -> bool {
        self.id.is_none()
    }

    /// Whether this frame answers the request `(method, id)`.
    pub fn answers(&self, method: &str, id: u64) -> bool {
        self.id == Some(id) && self.method == method
    }
}

/// Push events the gateway understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The node finished importing blocks up to `last_block_id`.
    BlocksSynchronized { last_block_id: BlockId },
    /// Some other event we ignore.
    Other(String),
}

impl Event {
    pub fn from_incoming(frame: Incoming) -> Result<Self, String> {
        if frame.method != EVENT_BLOCKS_SYNCHRONIZED {
            return Ok(Event::Other(frame.method));
        }
        let params = frame.params.unwrap_or(Value::Null);
        let parsed: ChainState = serde_json::from_value(params)
            .map_err(|e| format!("malformed {} event: {}", EVENT_BLOCKS_SYNCHRONIZED, e))?;
        Ok(Event::BlocksSynchronized {
            last_block_id: parsed.last_block_id,
        })
    }
}

/// Result of `chain_state` and payload of `blocks_synchronized`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainState {
    pub last_block_id: BlockId,
}

/// Result of `block_by_id`: the raw block as hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub data: String,
}

/// Result of `wallet_state`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WalletState {
    #[serde(default)]
    pub balances: HashMap<Token, Amount>,
    #[serde(default)]
    pub tags: Vec<WalletTag>,
    #[serde(default)]
    pub last_nonce: u64,
}

impl WalletState {
    pub fn balance(&self, token: Token) -> Amount {
        self.balances.get(&token).copied().unwrap_or(Amount::ZERO)
    }

    pub fn has_tag(&self, tag: WalletTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// Result of `add_transaction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitted {
    #[serde(default)]
    pub digest: Option<Digest>,
}
