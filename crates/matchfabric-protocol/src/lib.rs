//! Matchfabric Protocol -- packet layout, body encoding, stream framing.
//!
//! TCP between matching servers and the config authority.
//! Fixed 20-byte little-endian header + serde JSON body.
//!
//! The header layout is fixed, but the body is JSON rather than a
//! schema-compiled binary table (e.g. FlatBuffers), so only nodes speaking
//! this encoding can exchange messages.

pub mod codec;
pub mod messages;

pub use codec::{pack, unpack, FrameCodec};
pub use messages::*;

/// Size of the fixed header: five little-endian i32 fields.
/// Also the smallest buffer that can be a valid message.
pub const HEADER_SIZE: usize = 20;

/// Default upper bound on a single framed message (header + body).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Node code assigned by the authority. `0` means unassigned / the authority itself.
pub type NodeId = i32;

/// Code used for the authority and for a node that has not registered yet.
pub const UNASSIGNED_NODE: NodeId = 0;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("buffer of {size} bytes is smaller than the {min}-byte header")]
    Undersized { size: usize, min: usize },
    #[error("header declares invalid body length {0}")]
    InvalidLength(i32),
    #[error("header declares {declared} body bytes but only {available} follow")]
    Truncated { declared: usize, available: usize },
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("unknown terminal type code {0}")]
    UnknownTerminal(i32),
    #[error("unknown command code {0}")]
    UnknownCommand(i32),
    #[error("unknown status code {0}")]
    UnknownStatus(i32),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
