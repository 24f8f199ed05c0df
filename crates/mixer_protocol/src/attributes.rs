//! Room and client attributes
//!
//! Attributes are JSON objects broadcast through `ROOM_UPDATE` and
//! `CLIENT_UPDATE`. The well-known keys are listed here; clients may add
//! arbitrary custom keys.

use serde_json::{Map, Value};

use crate::codec;
use crate::command::Command;
use crate::message::MessageType;
use crate::ProtocolResult;

/// Well-known room attribute keys
pub struct RoomAttributes;

impl RoomAttributes {
    pub const NAME: &'static str = "name";
    pub const KEEP_OPEN: &'static str = "keep_open";
    pub const COMMAND_COUNT: &'static str = "command_count";
    pub const BYTE_SIZE: &'static str = "byte_size";
    pub const JOINABLE: &'static str = "joinable";
    pub const ENGINE_VERSION: &'static str = "engine_version";
    pub const PROTOCOL_VERSION: &'static str = "protocol_version";
    pub const IGNORE_VERSION_CHECK: &'static str = "ignore_version_check";
    pub const GENERIC_PROTOCOL: &'static str = "generic_protocol";
}

/// Well-known client attribute keys
pub struct ClientAttributes;

impl ClientAttributes {
    pub const ID: &'static str = "id";
    pub const NAME: &'static str = "name";
    pub const IP: &'static str = "ip";
    pub const PORT: &'static str = "port";
    pub const ROOM: &'static str = "room";
    pub const USERSCENES: &'static str = "userscenes";
    pub const USERMODE: &'static str = "usermode";
}

/// Payload of a `JOIN_ROOM` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRoomRequest {
    /// Room to create or join
    pub room_name: String,
    /// Host engine version of the requesting peer
    pub engine_version: String,
    /// Protocol version of the requesting peer
    pub protocol_version: String,
    /// Creator only: accept peers with mismatching versions
    pub ignore_version_check: bool,
    /// Whether the peer uses the generic datablock protocol
    pub generic_protocol: bool,
}

impl JoinRoomRequest {
    /// Create a request with this crate's protocol version
    pub fn new(room_name: impl Into<String>, engine_version: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            engine_version: engine_version.into(),
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            ignore_version_check: false,
            generic_protocol: true,
        }
    }

    /// Set the version check flag (builder pattern)
    pub fn with_ignore_version_check(mut self, ignore: bool) -> Self {
        self.ignore_version_check = ignore;
        self
    }

    /// Encode as a payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = codec::encode_string(&self.room_name);
        buffer.extend(codec::encode_string(&self.engine_version));
        buffer.extend(codec::encode_string(&self.protocol_version));
        buffer.extend(codec::encode_bool(self.ignore_version_check));
        buffer.extend(codec::encode_bool(self.generic_protocol));
        buffer
    }

    /// Decode from a payload
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let (room_name, index) = codec::decode_string(payload, 0)?;
        let (engine_version, index) = codec::decode_string(payload, index)?;
        let (protocol_version, index) = codec::decode_string(payload, index)?;
        let (ignore_version_check, index) = codec::decode_bool(payload, index)?;
        let (generic_protocol, _) = codec::decode_bool(payload, index)?;
        Ok(Self {
            room_name,
            engine_version,
            protocol_version,
            ignore_version_check,
            generic_protocol,
        })
    }

    /// Build the command
    pub fn to_command(&self) -> Command {
        Command::new(MessageType::JoinRoom, self.encode())
    }
}

/// Build an update command whose payload is `{key: attributes}`
pub fn update_command(
    message_type: MessageType,
    key: &str,
    attributes: Map<String, Value>,
) -> ProtocolResult<Command> {
    let mut body = Map::new();
    body.insert(key.to_string(), Value::Object(attributes));
    Ok(Command::new(message_type, codec::encode_json(&body)?))
}

/// Decode a JSON object payload
pub fn decode_object(payload: &[u8]) -> ProtocolResult<Map<String, Value>> {
    let (map, _) = codec::decode_json(payload, 0)?;
    Ok(map)
}

/// Merge `update` into `target`, replacing keys present in both
pub fn merge_into(target: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_request_payload() {
        let request = JoinRoomRequest::new("studio", "3.0").with_ignore_version_check(true);
        let decoded = JoinRoomRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(request.to_command().target_path().as_deref(), Some("studio"));
    }

    #[test]
    fn test_join_request_truncated() {
        let payload = codec::encode_string("studio");
        assert!(JoinRoomRequest::decode(&payload).is_err());
    }

    #[test]
    fn test_update_command() {
        let mut attributes = Map::new();
        attributes.insert(RoomAttributes::JOINABLE.to_string(), json!(true));
        let command = update_command(MessageType::RoomUpdate, "studio", attributes).unwrap();

        let body = decode_object(&command.payload).unwrap();
        assert_eq!(body["studio"][RoomAttributes::JOINABLE], json!(true));
    }

    #[test]
    fn test_merge_into() {
        let mut target = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let update = json!({"b": 3, "c": 4}).as_object().cloned().unwrap();
        merge_into(&mut target, &update);
        assert_eq!(Value::Object(target), json!({"a": 1, "b": 3, "c": 4}));
    }
}
