//! Codec for encoding/decoding metadata exchange frames

use crate::metadata::NodeMetadata;
use crate::{HEADER_SIZE, MAX_FRAME_SIZE};
use bincode::Options;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Outcome of trying to decode a frame from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// Not enough bytes buffered yet
    Incomplete,
    /// A complete frame was decoded; `consumed` counts header and body
    Decoded {
        metadata: NodeMetadata,
        consumed: usize,
    },
    /// The frame arrived in full but its body is not a metadata record.
    /// `consumed` is the length of the bad frame so callers can skip it.
    Malformed { consumed: usize, reason: String },
    /// The header declares a body over `MAX_FRAME_SIZE`
    Oversized(usize),
}

/// Metadata exchange frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a metadata record into a frame
    ///
    /// Format: [length: u32][body: bincode serialized record]
    pub fn encode(metadata: &NodeMetadata) -> Result<Bytes, CodecError> {
        let body = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(metadata)?;

        if body.len() > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge(body.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        Ok(buf.freeze())
    }

    /// Total frame length (header + body) announced by the header at the start of `buf`
    ///
    /// Returns Ok(None) if fewer than 4 bytes are buffered,
    /// Err if the declared body exceeds `MAX_FRAME_SIZE`
    pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_SIZE];
        length_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes);

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length as usize));
        }

        Ok(Some(HEADER_SIZE + length as usize))
    }

    /// Try to decode a frame from the start of `buf`
    ///
    /// Never reads past the declared body length, and never modifies `buf`:
    /// the caller drops `consumed` bytes itself.
    pub fn try_decode(buf: &[u8]) -> DecodeResult {
        let consumed = match Self::frame_len(buf) {
            Ok(Some(total)) => total,
            Ok(None) => return DecodeResult::Incomplete,
            Err(CodecError::FrameTooLarge(length)) => return DecodeResult::Oversized(length),
            Err(e) => {
                return DecodeResult::Malformed {
                    consumed: 0,
                    reason: e.to_string(),
                }
            }
        };
        let length = consumed - HEADER_SIZE;

        if buf.len() < consumed {
            trace!(
                "Frame incomplete: have {} of {} bytes",
                buf.len(),
                consumed
            );
            return DecodeResult::Incomplete;
        }

        let body = &buf[HEADER_SIZE..consumed];
        let decoded: Result<NodeMetadata, bincode::Error> = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(length as u64)
            .reject_trailing_bytes()
            .deserialize(body);

        match decoded {
            Ok(metadata) => DecodeResult::Decoded { metadata, consumed },
            Err(e) => DecodeResult::Malformed {
                consumed,
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeMetadata {
        NodeMetadata::new("sidecar~10.0.0.1~app.ns", "app.ns")
            .with_label("app", "reviews")
            .with_label("version", "v2")
    }

    #[test]
    fn test_encode_decode() {
        let meta = sample();
        let encoded = FrameCodec::encode(&meta).unwrap();

        let result = FrameCodec::try_decode(&encoded);
        assert_eq!(
            result,
            DecodeResult::Decoded {
                metadata: meta,
                consumed: encoded.len(),
            }
        );
    }

    #[test]
    fn test_header_carries_body_length() {
        let encoded = FrameCodec::encode(&sample()).unwrap();
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, encoded.len() - HEADER_SIZE);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = FrameCodec::encode(&sample()).unwrap();
        let b = FrameCodec::encode(&sample()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_incomplete_header() {
        assert_eq!(FrameCodec::try_decode(&[]), DecodeResult::Incomplete);
        assert_eq!(FrameCodec::try_decode(&[0, 0, 0]), DecodeResult::Incomplete);
    }

    #[test]
    fn test_decode_every_prefix_is_incomplete() {
        let meta = sample();
        let encoded = FrameCodec::encode(&meta).unwrap();

        for end in 0..encoded.len() {
            assert_eq!(
                FrameCodec::try_decode(&encoded[..end]),
                DecodeResult::Incomplete,
                "prefix of {} bytes",
                end
            );
        }
    }

    #[test]
    fn test_decode_ignores_trailing_stream_bytes() {
        let meta = sample();
        let encoded = FrameCodec::encode(&meta).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded);
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");

        match FrameCodec::try_decode(&buf) {
            DecodeResult::Decoded { metadata, consumed } => {
                assert_eq!(metadata, meta);
                assert_eq!(consumed, encoded.len());
                // What follows the frame is application data, not another frame
                let rest = buf.split_off(consumed);
                assert_eq!(&rest[..], b"GET / HTTP/1.1\r\n");
                assert!(!matches!(
                    FrameCodec::try_decode(&rest),
                    DecodeResult::Decoded { .. }
                ));
            }
            other => panic!("Expected Decoded, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&[0xff; 8]);

        match FrameCodec::try_decode(&buf) {
            DecodeResult::Malformed { consumed, .. } => assert_eq!(consumed, 12),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_utf8_is_malformed() {
        // node_id length 1 followed by a lone continuation byte
        let mut body = Vec::new();
        body.extend_from_slice(&1u64.to_le_bytes());
        body.push(0x80);

        let mut buf = Vec::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        assert!(matches!(
            FrameCodec::try_decode(&buf),
            DecodeResult::Malformed { .. }
        ));
    }

    #[test]
    fn test_decode_rejects_garbage_inside_declared_length() {
        let encoded = FrameCodec::encode(&sample()).unwrap();
        let body_len = encoded.len() - HEADER_SIZE;

        let mut buf = Vec::new();
        buf.extend_from_slice(&((body_len + 2) as u32).to_be_bytes());
        buf.extend_from_slice(&encoded[HEADER_SIZE..]);
        buf.extend_from_slice(&[0xde, 0xad]);

        match FrameCodec::try_decode(&buf) {
            DecodeResult::Malformed { consumed, .. } => assert_eq!(consumed, buf.len()),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_oversized_header() {
        let buf = (MAX_FRAME_SIZE + 1).to_be_bytes();
        assert_eq!(
            FrameCodec::try_decode(&buf),
            DecodeResult::Oversized(MAX_FRAME_SIZE as usize + 1)
        );
    }

    #[test]
    fn test_empty_record_round_trip() {
        let meta = NodeMetadata::default();
        let encoded = FrameCodec::encode(&meta).unwrap();
        assert!(matches!(
            FrameCodec::try_decode(&encoded),
            DecodeResult::Decoded { metadata, .. } if metadata == meta
        ));
    }
}
