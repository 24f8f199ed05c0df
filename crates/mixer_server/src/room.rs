//! Rooms
//!
//! A room is one collaborative session: an append-only ordered command log
//! plus its member connections. Every command accepted by [`Room::add_command`]
//! is pushed to the other members' queues while the room lock is held, so all
//! members observe the same relative order.
//!
//! ## Late Join
//!
//! [`Room::add_client`] replays the log in batches. The lock is only held to
//! copy the next batch; once the remaining backlog is at most
//! [`RoomPolicy::join_batch_threshold`] commands, the tail is sent and the
//! joiner becomes a member within the same critical section, so no command
//! can fall between replay and live broadcast.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use mixer_protocol::{codec, attributes, Command, JoinRoomRequest, MessageType, RoomAttributes};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};

/// Log and replay settings shared by all rooms of a server
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    /// Late join finalizes once the remaining backlog is at most this long
    pub join_batch_threshold: usize,
    /// Room commands broadcast but never stored
    pub non_durable: HashSet<MessageType>,
}

impl RoomPolicy {
    /// Extract the room settings of a server configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            join_batch_threshold: config.join_batch_threshold,
            non_durable: config.non_durable.clone(),
        }
    }
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Result of a late join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection is a member; `replayed` commands were sent from the log
    Joined { replayed: usize },
    /// The connection closed during replay
    Aborted,
}

#[derive(Debug)]
struct RoomState {
    creator: ConnectionId,
    engine_version: String,
    protocol_version: String,
    ignore_version_check: bool,
    generic_protocol: bool,
    keep_open: bool,
    joinable: bool,
    commands: Vec<Arc<Command>>,
    byte_size: u64,
    members: Vec<Arc<Connection>>,
    join_count: usize,
    custom_attributes: Map<String, Value>,
}

impl RoomState {
    fn counters(&self) -> (usize, u64) {
        (self.commands.len(), self.byte_size)
    }

    /// Drop the last logged command if `command` supersedes it
    fn merge_last(&mut self, command: &Command) {
        let Some(last) = self.commands.last() else {
            return;
        };
        if last.message_type != command.message_type {
            return;
        }
        let target = command.target_path();
        if target.is_none() || last.target_path() != target {
            return;
        }
        self.byte_size -= last.byte_size() as u64;
        self.commands.pop();
    }
}

/// A collaborative session
#[derive(Debug)]
pub struct Room {
    name: String,
    policy: RoomPolicy,
    state: Mutex<RoomState>,
}

impl Room {
    /// Create a room whose first member is its creator.
    ///
    /// The room is not joinable until the creator has sent its initial
    /// content (see [`Room::set_joinable`]).
    pub fn new(creator: &Arc<Connection>, request: &JoinRoomRequest, policy: RoomPolicy) -> Self {
        Self {
            name: request.room_name.clone(),
            policy,
            state: Mutex::new(RoomState {
                creator: creator.id(),
                engine_version: request.engine_version.clone(),
                protocol_version: request.protocol_version.clone(),
                ignore_version_check: request.ignore_version_check,
                generic_protocol: request.generic_protocol,
                keep_open: false,
                joinable: false,
                commands: Vec::new(),
                byte_size: 0,
                members: vec![creator.clone()],
                join_count: 0,
                custom_attributes: Map::new(),
            }),
        }
    }

    /// Room name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the creating connection
    pub fn creator(&self) -> ConnectionId {
        self.state.lock().creator
    }

    /// Log a command and broadcast it to every member but `sender`.
    ///
    /// Returns the changed `command_count`/`byte_size` attributes, if any.
    pub fn add_command(&self, command: Arc<Command>, sender: ConnectionId) -> Option<Map<String, Value>> {
        let mut state = self.state.lock();
        let before = state.counters();

        if !self.policy.non_durable.contains(&command.message_type) {
            if command.message_type.is_mergeable() && state.join_count == 0 {
                state.merge_last(&command);
            }
            state.byte_size += command.byte_size() as u64;
            state.commands.push(command.clone());
        }

        for member in &state.members {
            if member.id() != sender {
                member.send(command.clone());
            }
        }

        let (count, bytes) = state.counters();
        if (count, bytes) == before {
            return None;
        }
        let mut changes = Map::new();
        changes.insert(RoomAttributes::COMMAND_COUNT.to_string(), json!(count));
        changes.insert(RoomAttributes::BYTE_SIZE.to_string(), json!(bytes));
        Some(changes)
    }

    /// Reserve a join slot. Must precede [`Room::add_client`]; while the slot
    /// is held the room is not deleted and log entries are not merged.
    pub fn begin_join(&self) {
        self.state.lock().join_count += 1;
    }

    /// Replay the log to `connection` and make it a member.
    ///
    /// Sends `CLEAR_CONTENT` first and the `JOIN_ROOM` acknowledgement last.
    /// Releases the join slot taken by [`Room::begin_join`] in all cases.
    pub fn add_client(&self, connection: &Arc<Connection>) -> JoinOutcome {
        connection.send_command(Command::empty(MessageType::ClearContent));

        let mut offset = 0;
        loop {
            if connection.is_closed() {
                self.state.lock().join_count -= 1;
                log::info!(
                    "Join of {} to room '{}' aborted after {} commands",
                    connection.id(),
                    self.name,
                    offset
                );
                return JoinOutcome::Aborted;
            }

            let batch: Vec<Arc<Command>> = {
                let mut state = self.state.lock();
                let remaining = &state.commands[offset..];
                if remaining.len() <= self.policy.join_batch_threshold {
                    for command in remaining {
                        connection.send(command.clone());
                    }
                    let replayed = state.commands.len();
                    state.members.push(connection.clone());
                    state.join_count -= 1;
                    connection.send_command(Command::new(
                        MessageType::JoinRoom,
                        codec::encode_string(&self.name),
                    ));
                    log::info!(
                        "{} joined room '{}' ({} commands replayed)",
                        connection.id(),
                        self.name,
                        replayed
                    );
                    return JoinOutcome::Joined { replayed };
                }
                remaining.to_vec()
            };

            for command in &batch {
                connection.send(command.clone());
            }
            offset += batch.len();
            log::debug!(
                "Room '{}': replayed {} commands to {}",
                self.name,
                offset,
                connection.id()
            );
        }
    }

    /// Remove a member. Returns whether it was a member.
    pub fn remove_client(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock();
        let before = state.members.len();
        state.members.retain(|member| member.id() != id);
        state.members.len() != before
    }

    /// Whether the room should be deleted now
    pub fn should_delete(&self) -> bool {
        let state = self.state.lock();
        state.members.is_empty() && state.join_count == 0 && !state.keep_open
    }

    /// Whether peers may join
    pub fn is_joinable(&self) -> bool {
        self.state.lock().joinable
    }

    /// Mark the initial content as complete
    pub fn set_joinable(&self) {
        self.state.lock().joinable = true;
    }

    /// Keep the room when it has no members
    pub fn set_keep_open(&self, keep_open: bool) {
        self.state.lock().keep_open = keep_open;
    }

    /// Whether the room outlives its members
    pub fn keep_open(&self) -> bool {
        self.state.lock().keep_open
    }

    /// Check a join request against the creator's versions
    pub fn check_version(&self, request: &JoinRoomRequest) -> Result<(), String> {
        let state = self.state.lock();
        if state.ignore_version_check {
            return Ok(());
        }
        if state.engine_version != request.engine_version
            || state.protocol_version != request.protocol_version
        {
            return Err(format!(
                "Room '{}' requires engine {} / protocol {}, got engine {} / protocol {}",
                self.name,
                state.engine_version,
                state.protocol_version,
                request.engine_version,
                request.protocol_version
            ));
        }
        Ok(())
    }

    /// Merge custom attributes
    pub fn merge_custom_attributes(&self, update: &Map<String, Value>) {
        attributes::merge_into(&mut self.state.lock().custom_attributes, update);
    }

    /// Full attribute map
    pub fn attributes(&self) -> Map<String, Value> {
        let state = self.state.lock();
        let mut map = state.custom_attributes.clone();
        map.insert(RoomAttributes::NAME.to_string(), json!(self.name));
        map.insert(RoomAttributes::KEEP_OPEN.to_string(), json!(state.keep_open));
        map.insert(RoomAttributes::COMMAND_COUNT.to_string(), json!(state.commands.len()));
        map.insert(RoomAttributes::BYTE_SIZE.to_string(), json!(state.byte_size));
        map.insert(RoomAttributes::JOINABLE.to_string(), json!(state.joinable));
        map.insert(RoomAttributes::ENGINE_VERSION.to_string(), json!(state.engine_version));
        map.insert(
            RoomAttributes::PROTOCOL_VERSION.to_string(),
            json!(state.protocol_version),
        );
        map.insert(
            RoomAttributes::IGNORE_VERSION_CHECK.to_string(),
            json!(state.ignore_version_check),
        );
        map.insert(
            RoomAttributes::GENERIC_PROTOCOL.to_string(),
            json!(state.generic_protocol),
        );
        map
    }

    /// Number of logged commands
    pub fn command_count(&self) -> usize {
        self.state.lock().commands.len()
    }

    /// Total wire size of the log
    pub fn byte_size(&self) -> u64 {
        self.state.lock().byte_size
    }

    /// Snapshot of the log
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.state.lock().commands.clone()
    }

    /// Number of members
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Number of peers mid-join
    pub fn join_count(&self) -> usize {
        self.state.lock().join_count
    }

    /// Ids of the members
    pub fn client_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().members.iter().map(|m| m.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    fn connection() -> (Arc<Connection>, Receiver<Arc<Command>>) {
        Connection::new("127.0.0.1:5000".parse().unwrap())
    }

    fn room(creator: &Arc<Connection>) -> Room {
        Room::new(creator, &JoinRoomRequest::new("studio", "3.0"), RoomPolicy::default())
    }

    fn transform(path: &str) -> Arc<Command> {
        Arc::new(Command::new(MessageType::Transform, codec::encode_string(path)))
    }

    #[test]
    fn test_new_room_not_joinable() {
        let (creator, _rx) = connection();
        let room = room(&creator);
        assert!(!room.is_joinable());
        assert_eq!(room.member_count(), 1);
        assert_eq!(room.creator(), creator.id());
        room.set_joinable();
        assert!(room.is_joinable());
    }

    #[test]
    fn test_add_command_skips_sender() {
        let (a, rx_a) = connection();
        let (b, rx_b) = connection();
        let room = room(&a);
        room.begin_join();
        room.add_client(&b);
        let _ = rx_b.try_iter().count();

        let changes = room
            .add_command(Arc::new(Command::empty(MessageType::GroupBegin)), a.id())
            .unwrap();
        assert_eq!(changes["command_count"], json!(1));
        assert_eq!(rx_a.len(), 0);
        assert_eq!(rx_b.len(), 1);
    }

    #[test]
    fn test_merge_same_target() {
        let (a, _rx) = connection();
        let room = room(&a);
        room.add_command(transform("u1"), a.id());
        room.add_command(transform("u1"), a.id());
        assert_eq!(room.command_count(), 1);
        assert_eq!(room.byte_size(), transform("u1").byte_size() as u64);

        room.add_command(transform("u2"), a.id());
        assert_eq!(room.command_count(), 2);
    }

    #[test]
    fn test_no_merge_for_non_mergeable() {
        let (a, _rx) = connection();
        let room = room(&a);
        let update = || Arc::new(Command::new(MessageType::DataUpdate, codec::encode_string("u1")));
        room.add_command(update(), a.id());
        room.add_command(update(), a.id());
        assert_eq!(room.command_count(), 2);
    }

    #[test]
    fn test_no_merge_while_joining() {
        let (a, _rx) = connection();
        let room = room(&a);
        room.add_command(transform("u1"), a.id());
        room.begin_join();
        room.add_command(transform("u1"), a.id());
        assert_eq!(room.command_count(), 2);
    }

    #[test]
    fn test_non_durable_broadcast_only() {
        let (a, _rx_a) = connection();
        let (b, rx_b) = connection();
        let room = room(&a);
        room.begin_join();
        room.add_client(&b);
        let _ = rx_b.try_iter().count();

        let changes = room.add_command(Arc::new(Command::empty(MessageType::Frame)), a.id());
        assert!(changes.is_none());
        assert_eq!(room.command_count(), 0);
        assert_eq!(rx_b.len(), 1);
    }

    #[test]
    fn test_late_join_sequence() {
        let (a, _rx_a) = connection();
        let room = room(&a);
        for i in 0..200 {
            room.add_command(
                Arc::new(Command::new(MessageType::DataUpdate, codec::encode_string(&i.to_string()))),
                a.id(),
            );
        }

        let (b, rx_b) = connection();
        room.begin_join();
        assert_eq!(room.add_client(&b), JoinOutcome::Joined { replayed: 200 });
        assert_eq!(room.join_count(), 0);

        let received: Vec<_> = rx_b.try_iter().collect();
        assert_eq!(received.len(), 202);
        assert_eq!(received[0].message_type, MessageType::ClearContent);
        assert_eq!(received[201].message_type, MessageType::JoinRoom);
        for (i, command) in received[1..201].iter().enumerate() {
            assert_eq!(command.target_path(), Some(i.to_string()));
        }
    }

    #[test]
    fn test_join_aborted_when_closed() {
        let (a, _rx_a) = connection();
        let room = room(&a);
        let (b, _rx_b) = connection();
        b.close();
        room.begin_join();
        assert_eq!(room.add_client(&b), JoinOutcome::Aborted);
        assert_eq!(room.join_count(), 0);
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_should_delete() {
        let (a, _rx) = connection();
        let room = room(&a);
        assert!(!room.should_delete());
        assert!(room.remove_client(a.id()));
        assert!(room.should_delete());

        room.set_keep_open(true);
        assert!(!room.should_delete());
        room.set_keep_open(false);
        room.begin_join();
        assert!(!room.should_delete());
    }

    #[test]
    fn test_version_check() {
        let (a, _rx) = connection();
        let room = room(&a);
        assert!(room.check_version(&JoinRoomRequest::new("studio", "3.0")).is_ok());
        assert!(room.check_version(&JoinRoomRequest::new("studio", "2.9")).is_err());

        let lenient = Room::new(
            &a,
            &JoinRoomRequest::new("other", "3.0").with_ignore_version_check(true),
            RoomPolicy::default(),
        );
        assert!(lenient.check_version(&JoinRoomRequest::new("other", "2.9")).is_ok());
    }

    #[test]
    fn test_attributes() {
        let (a, _rx) = connection();
        let room = room(&a);
        let mut custom = Map::new();
        custom.insert("description".into(), json!("layout"));
        room.merge_custom_attributes(&custom);

        let attrs = room.attributes();
        assert_eq!(attrs["name"], json!("studio"));
        assert_eq!(attrs["joinable"], json!(false));
        assert_eq!(attrs["engine_version"], json!("3.0"));
        assert_eq!(attrs["description"], json!("layout"));
    }
}
