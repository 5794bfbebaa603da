//! Peer Metadata Exchange Protocol Definitions
//!
//! This crate defines the metadata record two adjacent proxies swap at the start
//! of a TCP connection, and the length-prefixed frame that carries it.
//!
//! Wire format: `[length: u32 big-endian][body: serialized NodeMetadata]`

pub mod codec;
pub mod metadata;

pub use codec::{CodecError, DecodeResult, FrameCodec};
pub use metadata::NodeMetadata;

/// Protocol identifier peers negotiate to signal exchange support
pub const DEFAULT_PROTOCOL: &str = "istio-peer-exchange";

/// Frame header size (body length prefix)
pub const HEADER_SIZE: usize = 4;

/// Maximum frame body size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
