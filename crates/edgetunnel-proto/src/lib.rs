//! Edge tunnel protocol definitions
//!
//! This crate defines the wire unit exchanged over an edge node's single
//! duplex stream, the typed category/type identifiers carried by every
//! message, and the length-prefixed codec used to frame them.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Topic used by node-level control messages (heartbeat, node closed)
pub const NODE_TOPIC: &str = "node";
