//! Datablock commands
//!
//! Changesets travel as room commands whose payload starts with the target
//! uuid, followed by a bincode body:
//!
//! | message type  | body                                   |
//! |---------------|----------------------------------------|
//! | `DATA_REMOVE` | [`Removal`]                            |
//! | `DATA_RENAME` | `Vec<`[`Rename`]`>`, applied as a batch |
//! | `DATA_CREATE` | [`DatablockProxy`]                     |
//! | `DATA_UPDATE` | [`DatablockDelta`]                     |
//! | `DATA_MEDIA`  | [`DatablockDelta`] with only a media change |
//! | `TRANSFORM`   | full object transform as doubles       |
//!
//! `TRANSFORM` carries the whole transform rather than a delta so that the
//! room may keep only the latest one per object. A changeset made only of
//! transforms is sent without group brackets, so consecutive transforms of
//! one object are adjacent in the room log.

use std::collections::BTreeMap;

use glam::{DQuat, DVec3};

use mixer_protocol::{codec, Command, MessageType, ProtocolResult};
use mixer_proxy::{
    Changeset, DatablockDelta, DatablockProxy, NodeKind, NodeUuid, ProxyState, RemoteOp, Removal,
    Rename, Value, ValueDelta, TRANSFORM_KEYS,
};

use crate::error::{ClientError, ClientResult};

/// Object transform as carried by `TRANSFORM`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Location
    pub translation: DVec3,
    /// Rotation quaternion, stored in attributes as `[w, x, y, z]`
    pub rotation: DQuat,
    /// Scale
    pub scale: DVec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            scale: DVec3::ONE,
        }
    }
}

impl Transform {
    /// Read the transform attributes. Returns `None` unless all three are
    /// present with the expected arity.
    pub fn from_attributes(attributes: &BTreeMap<String, Value>) -> Option<Self> {
        let vector = |key: &str, len: usize| {
            attributes
                .get(key)
                .and_then(|v| v.as_vector())
                .filter(|v| v.len() == len)
                .map(|v| v.to_vec())
        };
        let location = vector(TRANSFORM_KEYS[0], 3)?;
        let rotation = vector(TRANSFORM_KEYS[1], 4)?;
        let scale = vector(TRANSFORM_KEYS[2], 3)?;
        Some(Self::from_components(&location, &rotation, &scale))
    }

    /// `rotation` is `[w, x, y, z]`
    fn from_components(location: &[f64], rotation: &[f64], scale: &[f64]) -> Self {
        Self {
            translation: DVec3::from_slice(location),
            rotation: DQuat::from_xyzw(rotation[1], rotation[2], rotation[3], rotation[0]),
            scale: DVec3::from_slice(scale),
        }
    }

    fn rotation_wxyz(&self) -> [f64; 4] {
        let q = self.rotation;
        [q.w, q.x, q.y, q.z]
    }

    /// Attribute values, keyed like [`TRANSFORM_KEYS`]
    pub fn to_attributes(&self) -> [(&'static str, Value); 3] {
        [
            (TRANSFORM_KEYS[0], Value::Vector(self.translation.to_array().to_vec())),
            (TRANSFORM_KEYS[1], Value::Vector(self.rotation_wxyz().to_vec())),
            (TRANSFORM_KEYS[2], Value::Vector(self.scale.to_array().to_vec())),
        ]
    }

    /// Encode as a `TRANSFORM` payload for `uuid`
    pub fn encode(&self, uuid: NodeUuid) -> Vec<u8> {
        let mut buffer = codec::encode_string(&uuid.to_string());
        buffer.extend(codec::encode_doubles(&self.translation.to_array()));
        buffer.extend(codec::encode_doubles(&self.rotation_wxyz()));
        buffer.extend(codec::encode_doubles(&self.scale.to_array()));
        buffer
    }

    /// Decode a `TRANSFORM` payload
    pub fn decode(payload: &[u8]) -> ProtocolResult<(String, Self)> {
        let (path, index) = codec::decode_string(payload, 0)?;
        let (translation, index) = codec::decode_doubles(payload, index, 3)?;
        let (rotation, index) = codec::decode_doubles(payload, index, 4)?;
        let (scale, _) = codec::decode_doubles(payload, index, 3)?;
        Ok((path, Self::from_components(&translation, &rotation, &scale)))
    }

    /// Delta replacing the transform attributes of an object
    pub fn to_delta(&self, uuid: NodeUuid) -> DatablockDelta {
        let mut change = DatablockDelta::new(uuid, NodeKind::Object);
        for (key, value) in self.to_attributes() {
            change.attributes.updated.insert(key.to_string(), ValueDelta::Replace(value));
        }
        change
    }
}

/// Encode a locally observed changeset.
///
/// `state` must already hold the changeset (see
/// [`ProxyState::apply_local`]); transforms are read from it. Commands are
/// emitted removals first, then renames, creations and updates, bracketed
/// by `GROUP_BEGIN` and `GROUP_END`. A changeset that encodes to
/// `TRANSFORM` commands only is returned without brackets.
pub fn encode_changeset(changeset: &Changeset, state: &ProxyState) -> ClientResult<Vec<Command>> {
    if changeset.is_empty() {
        return Ok(Vec::new());
    }

    let mut body = Vec::new();
    for removal in &changeset.removals {
        body.push(targeted(MessageType::DataRemove, removal.uuid, removal)?);
    }
    if let Some(rename) = encode_renames(&changeset.renames)? {
        body.push(rename);
    }
    for creation in &changeset.creations {
        body.push(targeted(MessageType::DataCreate, creation.uuid, creation)?);
    }
    for change in &changeset.updates {
        body.push(encode_update(change, state)?);
    }

    if body.iter().all(|c| c.message_type == MessageType::Transform) {
        return Ok(body);
    }
    let mut commands = Vec::with_capacity(body.len() + 2);
    commands.push(Command::empty(MessageType::GroupBegin));
    commands.extend(body);
    commands.push(Command::empty(MessageType::GroupEnd));
    Ok(commands)
}

/// Encode a batch of renames as one `DATA_RENAME`
pub fn encode_renames(renames: &[Rename]) -> ClientResult<Option<Command>> {
    match renames.first() {
        None => Ok(None),
        Some(first) => targeted(MessageType::DataRename, first.uuid, renames).map(Some),
    }
}

fn encode_update(change: &DatablockDelta, state: &ProxyState) -> ClientResult<Command> {
    if change.kind.has_transform() && change.only_touches(&TRANSFORM_KEYS) {
        let transform = state
            .get(change.uuid)
            .and_then(|proxy| Transform::from_attributes(&proxy.attributes));
        if let Some(transform) = transform {
            return Ok(Command::new(MessageType::Transform, transform.encode(change.uuid)));
        }
    }
    let message_type = if change.is_media_only() {
        MessageType::DataMedia
    } else {
        MessageType::DataUpdate
    };
    targeted(message_type, change.uuid, change)
}

fn targeted<T: serde::Serialize + ?Sized>(
    message_type: MessageType,
    uuid: NodeUuid,
    body: &T,
) -> ClientResult<Command> {
    let payload = codec::encode_targeted(&uuid.to_string(), body)?;
    Ok(Command::new(message_type, payload))
}

/// Whether a command carries a datablock operation
pub fn is_datablock_command(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::DataCreate
            | MessageType::DataUpdate
            | MessageType::DataRemove
            | MessageType::DataRename
            | MessageType::DataMedia
            | MessageType::Transform
    )
}

/// Decode a received datablock command
pub fn decode_command(command: &Command) -> ClientResult<RemoteOp> {
    let op = match command.message_type {
        MessageType::DataCreate => {
            let (_, proxy): (String, DatablockProxy) = codec::decode_targeted(&command.payload)?;
            RemoteOp::Create(proxy)
        }
        MessageType::DataUpdate | MessageType::DataMedia => {
            let (_, change): (String, DatablockDelta) = codec::decode_targeted(&command.payload)?;
            RemoteOp::Update(change)
        }
        MessageType::DataRemove => {
            let (_, removal): (String, Removal) = codec::decode_targeted(&command.payload)?;
            RemoteOp::Remove(removal.uuid)
        }
        MessageType::DataRename => {
            let (_, renames): (String, Vec<Rename>) = codec::decode_targeted(&command.payload)?;
            RemoteOp::Rename(renames)
        }
        MessageType::Transform => {
            let (path, transform) = Transform::decode(&command.payload)?;
            let uuid: NodeUuid = path
                .parse()
                .map_err(|e| ClientError::InvalidPayload(format!("Bad uuid '{}': {}", path, e)))?;
            RemoteOp::Update(transform.to_delta(uuid))
        }
        other => {
            return Err(ClientError::InvalidPayload(format!(
                "{} is not a datablock command",
                other
            )))
        }
    };
    Ok(op)
}
