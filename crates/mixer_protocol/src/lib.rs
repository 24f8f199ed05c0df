//! # Mixer Protocol
//!
//! Wire format shared by the broadcast server and its clients.
//!
//! Every message is a [`Command`]: a type tag plus an opaque byte payload,
//! framed with a fixed little-endian header:
//!
//! ```text
//! +----------------------+-------------+------------------+-----------------+
//! | payload_length: u64  |  id: u32    | message_type: u16|  payload bytes  |
//! +----------------------+-------------+------------------+-----------------+
//! ```
//!
//! Message types below [`MessageType::Command`] are session control handled
//! by the server itself. Types above it are room commands: they are appended
//! to the room log and broadcast to the other members. Types inside the
//! optimized range may be merged with the previous log entry when they target
//! the same path.
//!
//! ## Usage
//!
//! ```ignore
//! use mixer_protocol::{codec, Command, MessageType};
//!
//! let command = Command::new(MessageType::JoinRoom, codec::encode_string("studio"));
//! command.write_to(&mut stream)?;
//! ```

pub mod attributes;
pub mod codec;
pub mod command;
pub mod message;

pub use attributes::{ClientAttributes, JoinRoomRequest, RoomAttributes};
pub use command::{Command, FrameDecoder, HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::MessageType;

use thiserror::Error;

/// Default TCP port of the broadcast server
pub const DEFAULT_PORT: u16 = 12800;

/// Default host clients connect to
pub const DEFAULT_HOST: &str = "localhost";

/// Version string of this protocol, compared on room join
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("Truncated payload: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("Invalid UTF-8 in string payload")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary payload error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the stream can continue after this error.
    ///
    /// Payload-level errors are reported to the peer; framing and transport
    /// errors end the connection.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::Closed | ProtocolError::Io(_)
        )
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
