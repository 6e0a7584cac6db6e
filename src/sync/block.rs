//! Binary block layout.
//!
//! # Layout (all integers big-endian)
//! ```text
//! header:
//!     version u16 | prev digest [32] | merkle root [32] | timestamp u64
//!     | tx count u16 | block id u256 | signer count u16
//!     | (public key [32] | signature [64]) * signer count
//! transaction entry (tx count times):
//!     type u16 | nonce u64 | sender [32] | timestamp u64 | body | signature [64]
//! ```
//!
//! The transaction digest is SHA-256 over the entry without its signature;
//! the signature is Ed25519 over that digest.

use alloy::primitives::U256;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::ledger::keys::SignerKey;
use crate::ledger::types::{Amount, BlockId, Digest, PublicKey, Token, WalletTag};

/// Errors raised while decoding a block. Any of them aborts the whole block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown transaction type {0:#06x}")]
    UnknownType(u16),

    #[error("malformed block: {0}")]
    Malformed(String),
}

/// A validator signature over the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSigner {
    pub public_key: PublicKey,
    pub signature: [u8; 64],
}

/// Decoded block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u16,
    pub prev_digest: Digest,
    pub merkle_root: Digest,
    pub timestamp: u64,
    pub tx_count: u16,
    pub block_id: BlockId,
    pub signers: Vec<BlockSigner>,
}

/// Transaction type tags.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Transfer = 1,
    NodeRegister = 2,
    NodeUnregister = 3,
    WalletTagSet = 4,
    WalletTagUnset = 5,
    UserData = 6,
    DistributionFee = 7,
}

impl TxKind {
    pub fn tag(&self) -> u16 {
        *self as u16
    }
}

/// Type-specific transaction payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxBody {
    Transfer {
        recipient: PublicKey,
        token: Token,
        amount: Amount,
        payload: Vec<u8>,
    },
    NodeRegister {
        node_key: PublicKey,
        address: String,
    },
    NodeUnregister {
        node_key: PublicKey,
    },
    WalletTagSet {
        wallet: PublicKey,
        tag: u16,
    },
    WalletTagUnset {
        wallet: PublicKey,
        tag: u16,
    },
    UserData {
        data: Vec<u8>,
    },
    DistributionFee {
        recipient: PublicKey,
        token: Token,
        amount: Amount,
    },
}

impl TxBody {
    pub fn kind(&self) -> TxKind {
        match self {
            TxBody::Transfer { .. } => TxKind::Transfer,
            TxBody::NodeRegister { .. } => TxKind::NodeRegister,
            TxBody::NodeUnregister { .. } => TxKind::NodeUnregister,
            TxBody::WalletTagSet { .. } => TxKind::WalletTagSet,
            TxBody::WalletTagUnset { .. } => TxKind::WalletTagUnset,
            TxBody::UserData { .. } => TxKind::UserData,
            TxBody::DistributionFee { .. } => TxKind::DistributionFee,
        }
    }

    /// Approve `wallet` for the restricted token.
    pub fn approve(wallet: PublicKey) -> Self {
        TxBody::WalletTagSet {
            wallet,
            tag: WalletTag::Approved as u16,
        }
    }
}

/// A transaction exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub nonce: u64,
    pub sender: PublicKey,
    pub timestamp: u64,
    pub body: TxBody,
    pub signature: [u8; 64],
}

impl SignedTx {
    /// Build and sign a transaction. Deterministic for identical inputs.
    pub fn sign(key: &SignerKey, nonce: u64, timestamp: u64, body: TxBody) -> Self {
        let mut tx = Self {
            nonce,
            sender: key.public_key(),
            timestamp,
            body,
            signature: [0u8; 64],
        };
        let digest = tx.digest();
        tx.signature = key.sign_digest(&digest);
        tx
    }

    pub fn kind(&self) -> TxKind {
        self.body.kind()
    }

    /// SHA-256 of the unsigned encoding.
    pub fn digest(&self) -> Digest {
        let mut unsigned = Vec::with_capacity(128);
        self.write_unsigned(&mut unsigned);
        Digest::from_slice(&Sha256::digest(&unsigned))
    }

    /// Full wire encoding including the signature.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(192);
        self.write_to(&mut out);
        out
    }

    /// Decode one standalone transaction, as submitted to `add_transaction`.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let tx = Self::read_from(&mut r)?;
        if r.remaining() != 0 {
            return Err(DecodeError::Malformed(format!("{} trailing bytes", r.remaining())));
        }
        Ok(tx)
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.write_unsigned(out);
        out.extend_from_slice(&self.signature);
    }

    fn write_unsigned(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.kind().tag().to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        match &self.body {
            TxBody::Transfer {
                recipient,
                token,
                amount,
                payload,
            } => {
                out.extend_from_slice(recipient.as_bytes());
                out.push(token.wire_id());
                out.extend_from_slice(&amount.units().to_be_bytes::<32>());
                write_bytes_u16(out, payload);
            }
            TxBody::NodeRegister { node_key, address } => {
                out.extend_from_slice(node_key.as_bytes());
                write_bytes_u16(out, address.as_bytes());
            }
            TxBody::NodeUnregister { node_key } => out.extend_from_slice(node_key.as_bytes()),
            TxBody::WalletTagSet { wallet, tag } | TxBody::WalletTagUnset { wallet, tag } => {
                out.extend_from_slice(wallet.as_bytes());
                out.extend_from_slice(&tag.to_be_bytes());
            }
            TxBody::UserData { data } => {
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            TxBody::DistributionFee {
                recipient,
                token,
                amount,
            } => {
                out.extend_from_slice(recipient.as_bytes());
                out.push(token.wire_id());
                out.extend_from_slice(&amount.units().to_be_bytes::<32>());
            }
        }
    }

    fn read_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let tag = r.u16()?;
        let nonce = r.u64()?;
        let sender = PublicKey(r.array32()?);
        let timestamp = r.u64()?;

        let body = match tag {
            1 => TxBody::Transfer {
                recipient: PublicKey(r.array32()?),
                token: r.token()?,
                amount: Amount::from_units(r.u256()?),
                payload: r.bytes_u16()?.to_vec(),
            },
            2 => {
                let node_key = PublicKey(r.array32()?);
                let address = String::from_utf8(r.bytes_u16()?.to_vec())
                    .map_err(|_| DecodeError::Malformed("node address is not utf-8".into()))?;
                TxBody::NodeRegister { node_key, address }
            }
            3 => TxBody::NodeUnregister {
                node_key: PublicKey(r.array32()?),
            },
            4 => TxBody::WalletTagSet {
                wallet: PublicKey(r.array32()?),
                tag: r.u16()?,
            },
            5 => TxBody::WalletTagUnset {
                wallet: PublicKey(r.array32()?),
                tag: r.u16()?,
            },
            6 => {
                let len = r.u32()? as usize;
                TxBody::UserData {
                    data: r.take(len)?.to_vec(),
                }
            }
            7 => TxBody::DistributionFee {
                recipient: PublicKey(r.array32()?),
                token: r.token()?,
                amount: Amount::from_units(r.u256()?),
            },
            other => return Err(DecodeError::UnknownType(other)),
        };

        let signature = r.array64()?;
        Ok(Self {
            nonce,
            sender,
            timestamp,
            body,
            signature,
        })
    }
}

/// Amount moved per token kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenAmounts {
    pub coin: Amount,
    pub stable: Amount,
}

impl TokenAmounts {
    pub fn single(token: Token, amount: Amount) -> Self {
        let mut out = Self::default();
        match token {
            Token::Coin => out.coin = amount,
            Token::Stable => out.stable = amount,
        }
        out
    }

    pub fn get(&self, token: Token) -> Amount {
        match token {
            Token::Coin => self.coin,
            Token::Stable => self.stable,
        }
    }
}

/// Normalized transaction record emitted by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub digest: Digest,
    pub block_id: BlockId,
    pub kind: TxKind,
    pub nonce: u64,
    pub sender: PublicKey,
    pub recipient: Option<PublicKey>,
    pub amounts: TokenAmounts,
    pub timestamp: u64,
    pub payload: Option<Vec<u8>>,
}

impl Transaction {
    /// Normalize a wire transaction into the common record.
    pub fn normalize(tx: &SignedTx, block_id: BlockId) -> Self {
        let (recipient, amounts, payload) = match &tx.body {
            TxBody::Transfer {
                recipient,
                token,
                amount,
                payload,
            } => (
                Some(*recipient),
                TokenAmounts::single(*token, *amount),
                (!payload.is_empty()).then(|| payload.clone()),
            ),
            TxBody::DistributionFee {
                recipient,
                token,
                amount,
            } => (Some(*recipient), TokenAmounts::single(*token, *amount), None),
            TxBody::WalletTagSet { wallet, .. } | TxBody::WalletTagUnset { wallet, .. } => {
                (Some(*wallet), TokenAmounts::default(), None)
            }
            TxBody::NodeRegister { address, .. } => {
                (None, TokenAmounts::default(), Some(address.as_bytes().to_vec()))
            }
            TxBody::NodeUnregister { .. } => (None, TokenAmounts::default(), None),
            TxBody::UserData { data } => (None, TokenAmounts::default(), Some(data.clone())),
        };

        Self {
            digest: tx.digest(),
            block_id,
            kind: tx.kind(),
            nonce: tx.nonce,
            sender: tx.sender,
            recipient,
            amounts,
            timestamp: tx.timestamp,
            payload,
        }
    }
}

/// Encode a block. The count written is `header.tx_count`, so a header that
/// disagrees with `txs` produces a block the decoder rejects.
pub fn encode_block(header: &BlockHeader, txs: &[SignedTx]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + txs.len() * 192);
    out.extend_from_slice(&header.version.to_be_bytes());
    out.extend_from_slice(header.prev_digest.as_slice());
    out.extend_from_slice(header.merkle_root.as_slice());
    out.extend_from_slice(&header.timestamp.to_be_bytes());
    out.extend_from_slice(&header.tx_count.to_be_bytes());
    out.extend_from_slice(&header.block_id.to_be_bytes());
    out.extend_from_slice(&(header.signers.len() as u16).to_be_bytes());
    for signer in &header.signers {
        out.extend_from_slice(signer.public_key.as_bytes());
        out.extend_from_slice(&signer.signature);
    }
    for tx in txs {
        tx.write_to(&mut out);
    }
    out
}

/// Decode a block, handing the header to `on_header` before any transaction
/// is decoded. Either every transaction decodes or the block is rejected.
pub fn decode_block<F>(bytes: &[u8], mut on_header: F) -> Result<(BlockHeader, Vec<SignedTx>), DecodeError>
where
    F: FnMut(&BlockHeader),
{
    let mut r = Reader::new(bytes);
    let header = decode_header(&mut r)?;
    on_header(&header);

    let mut txs = Vec::with_capacity(header.tx_count as usize);
    for _ in 0..header.tx_count {
        txs.push(SignedTx::read_from(&mut r)?);
    }
    if r.remaining() != 0 {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after {} transactions",
            r.remaining(),
            header.tx_count
        )));
    }
    Ok((header, txs))
}

fn decode_header(r: &mut Reader<'_>) -> Result<BlockHeader, DecodeError> {
    let version = r.u16()?;
    let prev_digest = Digest::from(r.array32()?);
    let merkle_root = Digest::from(r.array32()?);
    let timestamp = r.u64()?;
    let tx_count = r.u16()?;
    let block_id = BlockId::from_be_bytes(r.array32()?);
    let signer_count = r.u16()?;
    let mut signers = Vec::with_capacity(signer_count as usize);
    for _ in 0..signer_count {
        signers.push(BlockSigner {
            public_key: PublicKey(r.array32()?),
            signature: r.array64()?,
        });
    }
    Ok(BlockHeader {
        version,
        prev_digest,
        merkle_root,
        timestamp,
        tx_count,
        block_id,
        signers,
    })
}

fn write_bytes_u16(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&bytes[..len]);
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    fn array32(&mut self) -> Result<[u8; 32], DecodeError> {
        self.array::<32>()
    }

    fn array64(&mut self) -> Result<[u8; 64], DecodeError> {
        self.array::<64>()
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array::<8>()?))
    }

    fn u256(&mut self) -> Result<U256, DecodeError> {
        Ok(U256::from_be_bytes(self.array32()?))
    }

    fn token(&mut self) -> Result<Token, DecodeError> {
        let id = self.u8()?;
        Token::from_wire(id).ok_or_else(|| DecodeError::Malformed(format!("unknown token id {}", id)))
    }

    fn bytes_u16(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
