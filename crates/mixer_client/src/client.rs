//! Blocking room client
//!
//! Owns the TCP stream to the server. Outgoing commands are queued with
//! [`Client::add_command`] and written by [`Client::send_pending`]; incoming
//! commands are decoded by [`Client::fetch_commands`], which first runs the
//! default handlers keeping the room and client caches up to date.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use mixer_protocol::{
    attributes, codec, ClientAttributes, Command, FrameDecoder, JoinRoomRequest, MessageType,
    ProtocolError, RoomAttributes,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

const READ_CHUNK: usize = 64 * 1024;

/// Session state as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, not in a room
    Connected,
    /// Join requested, waiting for the acknowledgement
    Joining {
        /// Requested room
        room: String,
    },
    /// Member of a room
    InRoom {
        /// Current room
        room: String,
    },
    /// Connection lost or closed
    Disconnected,
}

impl ClientState {
    /// Check if the stream is usable
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// Traffic counters
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total commands sent
    pub commands_sent: u64,
    /// Total commands received
    pub commands_received: u64,
}

impl ClientStats {
    /// Record a sent command
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.commands_sent += 1;
    }

    /// Record received bytes
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}

/// Connection to a broadcast server
pub struct Client {
    config: ClientConfig,
    stream: TcpStream,
    decoder: FrameDecoder,
    /// Commands waiting to be written
    pending: VecDeque<Command>,
    /// Received commands not consumed by a default handler
    inbox: VecDeque<Command>,
    state: ClientState,
    client_id: Option<String>,
    rooms: Map<String, Value>,
    clients: Map<String, Value>,
    last_error: Option<String>,
    stats: ClientStats,
}

impl Client {
    /// Connect to the server
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        let address = config.address();
        let stream = TcpStream::connect(&address).map_err(|source| ClientError::ConnectionFailed {
            address: address.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_nodelay(true)?;
        log::info!("Connected to {}", address);

        Ok(Self {
            config,
            stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            inbox: VecDeque::new(),
            state: ClientState::Connected,
            client_id: None,
            rooms: Map::new(),
            clients: Map::new(),
            last_error: None,
            stats: ClientStats::default(),
        })
    }

    /// Settings
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Id assigned by the server
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Room this client is a member of
    pub fn current_room(&self) -> Option<&str> {
        match &self.state {
            ClientState::InRoom { room } => Some(room),
            _ => None,
        }
    }

    /// Cached attributes of every room
    pub fn rooms_attributes(&self) -> &Map<String, Value> {
        &self.rooms
    }

    /// Cached attributes of every client
    pub fn clients_attributes(&self) -> &Map<String, Value> {
        &self.clients
    }

    /// Cached byte size of a room's log
    pub fn room_byte_size(&self, room: &str) -> Option<u64> {
        self.rooms.get(room)?.get(RoomAttributes::BYTE_SIZE)?.as_u64()
    }

    /// Last error reported by the server
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Traffic counters
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Queue a command
    pub fn add_command(&mut self, command: Command) {
        self.pending.push_back(command);
    }

    /// Write every queued command. Returns the number written.
    pub fn send_pending(&mut self) -> ClientResult<usize> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let mut sent = 0;
        while let Some(command) = self.pending.pop_front() {
            let bytes = command.to_bytes();
            if let Err(e) = self.stream.write_all(&bytes) {
                self.mark_disconnected();
                return Err(e.into());
            }
            self.stats.record_sent(bytes.len());
            sent += 1;
        }
        if sent > 0 {
            self.stream.flush()?;
        }
        Ok(sent)
    }

    /// Queue and write a command
    pub fn send(&mut self, command: Command) -> ClientResult<()> {
        self.add_command(command);
        self.send_pending().map(|_| ())
    }

    /// Read what is available, run the default handlers and return the
    /// commands they did not consume, in arrival order
    pub fn fetch_commands(&mut self) -> ClientResult<Vec<Command>> {
        self.receive()?;
        Ok(self.inbox.drain(..).collect())
    }

    /// Read until a command of type `wanted` arrives. Commands not consumed
    /// by default handlers stay available to [`Client::fetch_commands`].
    ///
    /// A `SEND_ERROR` received meanwhile fails the wait.
    pub fn wait_for(&mut self, wanted: MessageType, timeout: Duration) -> ClientResult<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for message_type in self.receive()? {
                if message_type == wanted {
                    return Ok(());
                }
                if message_type == MessageType::SendError {
                    let message = self.last_error.clone().unwrap_or_default();
                    return Err(ClientError::Server(message));
                }
            }
        }
        Err(ClientError::Timeout(wanted.to_string()))
    }

    /// Read available bytes and dispatch complete commands. Returns the
    /// types of the decoded commands.
    fn receive(&mut self) -> ClientResult<Vec<MessageType>> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => {
                    self.mark_disconnected();
                    return Err(ProtocolError::Closed.into());
                }
                Ok(n) => {
                    self.decoder.feed(&buffer[..n]);
                    self.stats.record_received(n);
                    if n < buffer.len() {
                        break;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_disconnected();
                    return Err(e.into());
                }
            }
        }

        let mut received = Vec::new();
        loop {
            match self.decoder.next_frame() {
                Ok(Some(command)) => {
                    self.stats.commands_received += 1;
                    received.push(command.message_type);
                    if !self.handle_default(&command) {
                        self.inbox.push_back(command);
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => log::warn!("Skipping received command: {}", e),
                Err(e) => {
                    self.mark_disconnected();
                    return Err(e.into());
                }
            }
        }
        Ok(received)
    }

    fn mark_disconnected(&mut self) {
        if self.state != ClientState::Disconnected {
            log::info!("Disconnected from {}", self.config.address());
        }
        self.state = ClientState::Disconnected;
    }

    /// Close the connection
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            if let Err(e) = self.send_pending() {
                log::debug!("Pending commands lost on disconnect: {}", e);
            }
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                log::debug!("Socket shutdown failed: {}", e);
            }
        }
        self.mark_disconnected();
    }

    // ------------------------------------------------------------------
    // Default handlers
    // ------------------------------------------------------------------

    /// Update caches. Returns whether the command was consumed.
    fn handle_default(&mut self, command: &Command) -> bool {
        match self.try_handle_default(command) {
            Ok(consumed) => consumed,
            Err(e) => {
                log::warn!("Malformed {} payload: {}", command.message_type, e);
                true
            }
        }
    }

    fn try_handle_default(&mut self, command: &Command) -> ClientResult<bool> {
        let payload = &command.payload;
        match command.message_type {
            MessageType::ClientId => {
                let (id, _) = codec::decode_string(payload, 0)?;
                log::debug!("Client id {}", id);
                self.client_id = Some(id);
            }
            MessageType::ListRooms => {
                self.rooms = attributes::decode_object(payload)?;
            }
            MessageType::RoomUpdate => {
                merge_updates(&mut self.rooms, attributes::decode_object(payload)?);
            }
            MessageType::RoomDeleted => {
                let (name, _) = codec::decode_string(payload, 0)?;
                self.rooms.remove(&name);
                if self.current_room() == Some(name.as_str()) {
                    self.state = ClientState::Connected;
                }
            }
            MessageType::ListAllClients => {
                self.clients = attributes::decode_object(payload)?;
            }
            MessageType::ClientUpdate => {
                merge_updates(&mut self.clients, attributes::decode_object(payload)?);
            }
            MessageType::ClientDisconnected => {
                let (id, _) = codec::decode_string(payload, 0)?;
                self.clients.remove(&id);
            }
            MessageType::SendError => {
                let (message, _) = codec::decode_string(payload, 0)?;
                log::warn!("Server error: {}", message);
                if matches!(self.state, ClientState::Joining { .. }) {
                    self.state = ClientState::Connected;
                }
                self.last_error = Some(message);
            }
            MessageType::JoinRoom => {
                let (room, _) = codec::decode_string(payload, 0)?;
                log::info!("Joined room '{}'", room);
                self.state = ClientState::InRoom { room };
                return Ok(false);
            }
            MessageType::LeaveRoom => {
                self.state = ClientState::Connected;
                return Ok(false);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Create or join a room
    pub fn join_room(&mut self, room: &str) -> ClientResult<()> {
        let request = JoinRoomRequest::new(room, self.config.engine_version.clone())
            .with_ignore_version_check(self.config.ignore_version_check);
        let request = JoinRoomRequest {
            protocol_version: self.config.protocol_version.clone(),
            ..request
        };
        self.state = ClientState::Joining {
            room: room.to_string(),
        };
        self.send(request.to_command())
    }

    /// Leave the current room
    pub fn leave_room(&mut self) -> ClientResult<()> {
        if self.current_room().is_none() {
            return Err(ClientError::NotInRoom);
        }
        self.send(Command::empty(MessageType::LeaveRoom))
    }

    /// Request the room list
    pub fn list_rooms(&mut self) -> ClientResult<()> {
        self.send(Command::empty(MessageType::ListRooms))
    }

    /// Delete an empty room
    pub fn delete_room(&mut self, room: &str) -> ClientResult<()> {
        self.send(Command::new(MessageType::DeleteRoom, codec::encode_string(room)))
    }

    /// Request the client list
    pub fn list_all_clients(&mut self) -> ClientResult<()> {
        self.send(Command::empty(MessageType::ListAllClients))
    }

    /// Set the display name of this client
    pub fn set_client_name(&mut self, name: &str) -> ClientResult<()> {
        self.send(Command::new(MessageType::SetClientName, codec::encode_string(name)))
    }

    /// Merge custom attributes into this client's attributes
    pub fn set_client_attributes(&mut self, attributes: Map<String, Value>) -> ClientResult<()> {
        let payload = codec::encode_json(&attributes)?;
        self.send(Command::new(MessageType::SetClientCustomAttributes, payload))
    }

    /// Merge custom attributes into a room's attributes
    pub fn set_room_attributes(&mut self, room: &str, attributes: Map<String, Value>) -> ClientResult<()> {
        let mut payload = codec::encode_string(room);
        payload.extend(codec::encode_json(&attributes)?);
        self.send(Command::new(MessageType::SetRoomCustomAttributes, payload))
    }

    /// Keep a room alive without members
    pub fn set_room_keep_open(&mut self, room: &str, keep_open: bool) -> ClientResult<()> {
        let mut payload = codec::encode_string(room);
        payload.extend(codec::encode_bool(keep_open));
        self.send(Command::new(MessageType::SetRoomKeepOpen, payload))
    }

    /// Cached name of a client
    pub fn client_name(&self, id: &str) -> Option<&str> {
        self.clients.get(id)?.get(ClientAttributes::NAME)?.as_str()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Merge `{key: {changes}}` into a cache of `{key: {attributes}}`
fn merge_updates(cache: &mut Map<String, Value>, updates: Map<String, Value>) {
    for (key, changes) in updates {
        let Value::Object(changes) = changes else {
            continue;
        };
        let entry = cache.entry(key).or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = entry {
            attributes::merge_into(existing, &changes);
        }
    }
}
