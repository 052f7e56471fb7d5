//! Burrow protocol definitions
//!
//! Control messages exchanged between the relay and its agents, the
//! length-prefixed codec that carries them, and the frame format used by the
//! stream multiplexer.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{read_message, write_message, CodecError, MessageCodec};
pub use messages::*;
pub use mux::{Frame, FrameCodec, FrameError, FrameFlags, FrameHeader, FrameType, StreamId};

/// Protocol version; agents announcing a different major version are rejected
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload accepted from the wire (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Largest data payload a sender puts into a single frame
pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;

/// Reserved stream ID for control messages, implicitly open on both ends
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Initial per-stream receive window (256KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;
