//! Tokio codec for probe reply frames
//!
//! A reply frame uses a 3-byte header:
//! - version: 1 byte (u8)
//! - payload_length: 2 bytes (u16, big-endian)
//!
//! followed by a bincode-encoded [`ProbeReply`].

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::probe::ProbeStatus;

/// Size of the reply header in bytes
pub const REPLY_HEADER_SIZE: usize = 3;

/// Current reply frame version
pub const REPLY_VERSION: u8 = 1;

/// Maximum reply payload size
pub const MAX_REPLY_SIZE: usize = 1024;

/// The single message a probe handler sends before closing the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    /// Outcome of the probe
    pub status: ProbeStatus,
}

impl ProbeReply {
    /// Create a new reply
    pub fn new(status: ProbeStatus) -> Self {
        Self { status }
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        ReplyCodec::new().encode(self, &mut buf)?;
        Ok(buf)
    }
}

/// Codec for encoding/decoding probe replies
#[derive(Debug, Default)]
pub struct ReplyCodec {
    /// Payload length of a header already consumed
    pending_length: Option<usize>,
}

impl ReplyCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_length: None,
        }
    }
}

impl Decoder for ReplyCodec {
    type Item = ProbeReply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let payload_len = match self.pending_length.take() {
            Some(len) => len,
            None => {
                if src.len() < REPLY_HEADER_SIZE {
                    return Ok(None);
                }
                let version = src.get_u8();
                if version != REPLY_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(version));
                }
                src.get_u16() as usize
            }
        };

        if payload_len > MAX_REPLY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_REPLY_SIZE,
            });
        }

        if src.len() < payload_len {
            self.pending_length = Some(payload_len);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let reply: ProbeReply = bincode::deserialize(&payload)?;
        Ok(Some(reply))
    }
}

impl Encoder<ProbeReply> for ReplyCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: ProbeReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&reply)?;
        if payload.len() > MAX_REPLY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_REPLY_SIZE,
            });
        }

        dst.reserve(REPLY_HEADER_SIZE + payload.len());
        dst.put_u8(REPLY_VERSION);
        dst.put_u16(payload.len() as u16);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_reply() {
        let mut buf = ProbeReply::new(ProbeStatus::Registered).to_bytes().unwrap();
        let decoded = ReplyCodec::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.status, ProbeStatus::Registered);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = ReplyCodec::new();
        let mut full = ProbeReply::new(ProbeStatus::Taken).to_bytes().unwrap();

        let mut partial = full.split_to(REPLY_HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full.split_to(2));
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.status, ProbeStatus::Taken);
    }

    #[test]
    fn test_codec_rejects_unknown_version() {
        let mut buf = BytesMut::from(&[9u8, 0, 1, 0][..]);
        let result = ReplyCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_codec_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(REPLY_VERSION);
        buf.put_u16((MAX_REPLY_SIZE + 1) as u16);
        let result = ReplyCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }
}
