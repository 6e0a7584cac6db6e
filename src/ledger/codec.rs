//! NUL-terminated JSON framing for the ledger RPC connection.
//!
//! Every message on the wire is one UTF-8 JSON document followed by a single
//! `0x00` byte. The decoder yields [`Incoming`] frames; the encoder writes
//! [`Request`] frames.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ledger::rpc::{Incoming, Request};
use crate::ledger::types::LedgerError;

/// Frames larger than this are treated as a protocol violation.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

const TERMINATOR: u8 = 0;

/// Codec for NUL-delimited JSON frames.
#[derive(Debug, Clone)]
pub struct NulJsonCodec {
    max_frame: usize,
    /// Bytes already scanned for a terminator in the current buffer.
    scanned: usize,
}

impl NulJsonCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame, scanned: 0 }
    }
}

impl Default for NulJsonCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for NulJsonCodec {
    type Item = Incoming;
    type Error = LedgerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>, LedgerError> {
        loop {
            let pos = match src[self.scanned..].iter().position(|b| *b == TERMINATOR) {
                Some(offset) => self.scanned + offset,
                None => {
                    self.scanned = src.len();
                    if src.len() > self.max_frame {
                        return Err(LedgerError::Protocol(format!(
                            "frame exceeds {} bytes",
                            self.max_frame
                        )));
                    }
                    return Ok(None);
                }
            };
            self.scanned = 0;

            let frame = src.split_to(pos);
            src.advance(1);

            // Keep-alive padding between frames.
            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| LedgerError::Protocol(format!("malformed frame: {}", e)));
        }
    }
}

impl Encoder<Request> for NulJsonCodec {
    type Error = LedgerError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), LedgerError> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| LedgerError::Protocol(format!("encode failed: {}", e)))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_split_frames() {
        let mut codec = NulJsonCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"method":"chain_state","id":1,"res"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ult\":{\"last_block_id\":\"3\"}}\0{\"method\":\"blocks_synchronized\"");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.answers("chain_state", 1));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b",\"params\":{\"last_block_id\":\"4\"}}\0");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.is_event());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_appends_terminator() {
        let mut codec = NulJsonCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Request {
                    method: "chain_state".into(),
                    id: 9,
                    params: json!({}),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(*buf.last().unwrap(), 0);
        let decoded: Request = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(decoded.id, 9);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = NulJsonCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(LedgerError::Protocol(_))));
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let mut codec = NulJsonCodec::default();
        let mut buf = BytesMut::from(&b"{not json}\0"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(LedgerError::Protocol(_))));
    }
}
