//! Commands and framing
//!
//! A [`Command`] is the unit of transmission and of room log storage.
//! [`FrameDecoder`] reassembles commands from arbitrary socket reads.

use std::io::{self, Read, Write};

use crate::codec;
use crate::message::MessageType;
use crate::{ProtocolError, ProtocolResult};

/// Frame header size: payload length (u64) + id (u32) + message type (u16)
pub const HEADER_SIZE: usize = 14;

/// Maximum accepted payload size (256 MB)
pub const MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// A typed message with an opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Message type tag
    pub message_type: MessageType,
    /// Payload bytes, layout depends on the message type
    pub payload: Vec<u8>,
    /// Sender-assigned id, informational only
    pub id: u32,
}

impl Command {
    /// Create a command with id 0
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
            id: 0,
        }
    }

    /// Create a command without payload
    pub fn empty(message_type: MessageType) -> Self {
        Self::new(message_type, Vec::new())
    }

    /// Set the id (builder pattern)
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Size on the wire, header included
    pub fn byte_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// The leading string of the payload, used as merge key by rooms.
    ///
    /// Returns `None` if the payload does not start with a valid string.
    pub fn target_path(&self) -> Option<String> {
        codec::decode_string(&self.payload, 0).ok().map(|(path, _)| path)
    }

    /// Serialize header and payload into one buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.byte_size());
        buffer.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buffer.extend_from_slice(&self.id.to_le_bytes());
        buffer.extend_from_slice(&self.message_type.raw().to_le_bytes());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Write one frame to a stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> ProtocolResult<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame from a blocking stream
    pub fn read_from<R: Read>(reader: &mut R) -> ProtocolResult<Self> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).map_err(map_eof)?;
        let (length, id, raw_type) = parse_header(&header);
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).map_err(map_eof)?;

        let message_type = MessageType::try_from(raw_type)?;
        Ok(Self {
            message_type,
            payload,
            id,
        })
    }
}

fn map_eof(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Closed
    } else {
        ProtocolError::Io(e)
    }
}

fn parse_header(header: &[u8]) -> (u64, u32, u16) {
    let mut length = [0u8; 8];
    length.copy_from_slice(&header[0..8]);
    let mut id = [0u8; 4];
    id.copy_from_slice(&header[8..12]);
    let raw_type = u16::from_le_bytes([header[12], header[13]]);
    (u64::from_le_bytes(length), u32::from_le_bytes(id), raw_type)
}

/// Incremental frame decoder
///
/// Feed it whatever the socket returned and pull complete commands out.
/// A frame with an unknown type is consumed and reported as
/// [`ProtocolError::UnknownMessageType`] so the stream stays in sync; an
/// oversized frame is fatal since the stream cannot be resynchronized.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if any
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Command>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (length, id, raw_type) = parse_header(&self.buffer[..HEADER_SIZE]);
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = HEADER_SIZE + length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_SIZE..total].to_vec();
        self.buffer.drain(..total);

        let message_type = MessageType::try_from(raw_type)?;
        Ok(Some(Command {
            message_type,
            payload,
            id,
        }))
    }
}
