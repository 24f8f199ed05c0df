//! Message types
//!
//! Discriminants are fixed on the wire and must never be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Message type discriminant carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageType {
    // Session control, handled by the server
    JoinRoom = 1,
    LeaveRoom = 2,
    ListRooms = 3,
    /// Server -> creator: send the initial room content.
    /// Creator -> server: initial content has been fully sent.
    Content = 4,
    /// Server -> joining client: clear local state before the log replay
    ClearContent = 5,
    DeleteRoom = 6,
    SendError = 12,
    ConnectionLost = 13,
    ListAllClients = 14,
    SetClientName = 15,
    SetClientCustomAttributes = 16,
    SetRoomCustomAttributes = 17,
    SetRoomKeepOpen = 18,
    ClientId = 19,
    ClientUpdate = 20,
    RoomUpdate = 21,
    RoomDeleted = 22,
    ClientDisconnected = 23,

    /// Lower bound of room commands (exclusive)
    Command = 100,

    Delete = 101,
    Rename = 105,
    Duplicate = 106,
    GroupBegin = 110,
    GroupEnd = 111,
    DataCreate = 120,
    DataUpdate = 121,
    DataRemove = 122,
    DataRename = 123,
    DataMedia = 124,

    /// Lower bound of mergeable room commands (exclusive)
    OptimizedCommands = 200,
    Transform = 201,
    Frame = 205,
    Play = 206,
    Pause = 207,
    /// Upper bound of mergeable room commands (exclusive)
    EndOptimizedCommands = 999,
}

impl MessageType {
    /// All known message types, in discriminant order
    pub const ALL: &'static [MessageType] = &[
        MessageType::JoinRoom,
        MessageType::LeaveRoom,
        MessageType::ListRooms,
        MessageType::Content,
        MessageType::ClearContent,
        MessageType::DeleteRoom,
        MessageType::SendError,
        MessageType::ConnectionLost,
        MessageType::ListAllClients,
        MessageType::SetClientName,
        MessageType::SetClientCustomAttributes,
        MessageType::SetRoomCustomAttributes,
        MessageType::SetRoomKeepOpen,
        MessageType::ClientId,
        MessageType::ClientUpdate,
        MessageType::RoomUpdate,
        MessageType::RoomDeleted,
        MessageType::ClientDisconnected,
        MessageType::Command,
        MessageType::Delete,
        MessageType::Rename,
        MessageType::Duplicate,
        MessageType::GroupBegin,
        MessageType::GroupEnd,
        MessageType::DataCreate,
        MessageType::DataUpdate,
        MessageType::DataRemove,
        MessageType::DataRename,
        MessageType::DataMedia,
        MessageType::OptimizedCommands,
        MessageType::Transform,
        MessageType::Frame,
        MessageType::Play,
        MessageType::Pause,
        MessageType::EndOptimizedCommands,
    ];

    /// Raw wire value
    #[inline]
    pub fn raw(self) -> u16 {
        self as u16
    }

    /// Whether this command is logged in the room and broadcast to its members
    #[inline]
    pub fn is_room_command(self) -> bool {
        self.raw() > MessageType::Command.raw()
    }

    /// Whether this command may supersede the previous log entry for the same path
    #[inline]
    pub fn is_mergeable(self) -> bool {
        self.raw() > MessageType::OptimizedCommands.raw()
            && self.raw() < MessageType::EndOptimizedCommands.raw()
    }

    /// Upper-case name used in logs and on the command line
    pub fn name(self) -> &'static str {
        match self {
            MessageType::JoinRoom => "JOIN_ROOM",
            MessageType::LeaveRoom => "LEAVE_ROOM",
            MessageType::ListRooms => "LIST_ROOMS",
            MessageType::Content => "CONTENT",
            MessageType::ClearContent => "CLEAR_CONTENT",
            MessageType::DeleteRoom => "DELETE_ROOM",
            MessageType::SendError => "SEND_ERROR",
            MessageType::ConnectionLost => "CONNECTION_LOST",
            MessageType::ListAllClients => "LIST_ALL_CLIENTS",
            MessageType::SetClientName => "SET_CLIENT_NAME",
            MessageType::SetClientCustomAttributes => "SET_CLIENT_CUSTOM_ATTRIBUTES",
            MessageType::SetRoomCustomAttributes => "SET_ROOM_CUSTOM_ATTRIBUTES",
            MessageType::SetRoomKeepOpen => "SET_ROOM_KEEP_OPEN",
            MessageType::ClientId => "CLIENT_ID",
            MessageType::ClientUpdate => "CLIENT_UPDATE",
            MessageType::RoomUpdate => "ROOM_UPDATE",
            MessageType::RoomDeleted => "ROOM_DELETED",
            MessageType::ClientDisconnected => "CLIENT_DISCONNECTED",
            MessageType::Command => "COMMAND",
            MessageType::Delete => "DELETE",
            MessageType::Rename => "RENAME",
            MessageType::Duplicate => "DUPLICATE",
            MessageType::GroupBegin => "GROUP_BEGIN",
            MessageType::GroupEnd => "GROUP_END",
            MessageType::DataCreate => "DATA_CREATE",
            MessageType::DataUpdate => "DATA_UPDATE",
            MessageType::DataRemove => "DATA_REMOVE",
            MessageType::DataRename => "DATA_RENAME",
            MessageType::DataMedia => "DATA_MEDIA",
            MessageType::OptimizedCommands => "OPTIMIZED_COMMANDS",
            MessageType::Transform => "TRANSFORM",
            MessageType::Frame => "FRAME",
            MessageType::Play => "PLAY",
            MessageType::Pause => "PAUSE",
            MessageType::EndOptimizedCommands => "END_OPTIMIZED_COMMANDS",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.raw() == value)
            .ok_or(ProtocolError::UnknownMessageType(value))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase().replace('-', "_");
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| format!("Unknown message type: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_command_boundary() {
        assert!(!MessageType::JoinRoom.is_room_command());
        assert!(!MessageType::Command.is_room_command());
        assert!(MessageType::DataUpdate.is_room_command());
        assert!(MessageType::Transform.is_room_command());
    }

    #[test]
    fn test_mergeable_range() {
        assert!(MessageType::Transform.is_mergeable());
        assert!(MessageType::Frame.is_mergeable());
        assert!(!MessageType::OptimizedCommands.is_mergeable());
        assert!(!MessageType::EndOptimizedCommands.is_mergeable());
        assert!(!MessageType::DataUpdate.is_mergeable());
    }

    #[test]
    fn test_try_from_raw() {
        assert_eq!(MessageType::try_from(201).unwrap(), MessageType::Transform);
        assert!(matches!(
            MessageType::try_from(7),
            Err(ProtocolError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn test_parse_name() {
        assert_eq!("frame".parse::<MessageType>().unwrap(), MessageType::Frame);
        assert_eq!("data-update".parse::<MessageType>().unwrap(), MessageType::DataUpdate);
        assert!("bogus".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_all_is_sorted_and_unique() {
        for pair in MessageType::ALL.windows(2) {
            assert!(pair[0].raw() < pair[1].raw());
        }
    }
}
