//! Broadcast server
//!
//! The [`Server`] owns the room and connection registries behind a single
//! lock. The lock is only held for registry lookups and mutations, never
//! across socket I/O or a room replay.
//!
//! ## Usage
//!
//! ```ignore
//! use mixer_server::{Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::default());
//! let listener = server.bind()?;
//! server.run(listener)?;
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use mixer_protocol::{
    attributes, codec, ClientAttributes, Command, JoinRoomRequest, MessageType, ProtocolResult,
    RoomAttributes,
};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionWorker};
use crate::room::{JoinOutcome, Room, RoomPolicy};
use crate::simulation::NetworkSimulator;
use crate::{ServerError, ServerResult};

#[derive(Default)]
struct Registry {
    rooms: HashMap<String, Arc<Room>>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

/// Room broadcast server
pub struct Server {
    config: ServerConfig,
    policy: RoomPolicy,
    registry: Mutex<Registry>,
    shutdown: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a server
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let policy = RoomPolicy::from_config(&config);
        Arc::new(Self {
            config,
            policy,
            registry: Mutex::new(Registry::default()),
            shutdown: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        })
    }

    /// Configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listening socket
    pub fn bind(&self) -> ServerResult<TcpListener> {
        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        log::info!("Listening on {}", local);
        Ok(listener)
    }

    /// Bound address, once [`Server::bind`] succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Accept connections until [`Server::shutdown`] is called
    pub fn run(self: &Arc<Self>, listener: TcpListener) -> ServerResult<()> {
        listener.set_nonblocking(true)?;

        while !self.is_shutting_down() {
            match listener.accept() {
                Ok((stream, address)) => {
                    if let Err(e) = self.accept(stream, address) {
                        log::warn!("Failed to accept {}: {}", address, e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    thread::sleep(self.config.poll_interval);
                }
            }
        }

        self.close_all();
        log::info!("Server stopped");
        Ok(())
    }

    /// Bind, then run in a background thread
    pub fn spawn(self: &Arc<Self>) -> ServerResult<(SocketAddr, thread::JoinHandle<ServerResult<()>>)> {
        let listener = self.bind()?;
        let address = listener.local_addr()?;
        let server = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("mixer-accept".to_string())
            .spawn(move || server.run(listener))?;
        Ok((address, handle))
    }

    /// Request the accept loop and all workers to stop
    pub fn shutdown(&self) {
        log::info!("Shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.close_all();
    }

    /// Whether shutdown was requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn close_all(&self) {
        let registry = self.registry.lock();
        for connection in registry.connections.values() {
            connection.close();
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, address: SocketAddr) -> ServerResult<()> {
        stream.set_nonblocking(false)?;
        let (connection, outgoing) = self.register_connection(address);
        log::info!("New connection {} from {}", connection.id(), address);

        let simulator = NetworkSimulator::new(self.config.latency, self.config.bandwidth_mbps);
        let worker = ConnectionWorker::new(connection.clone(), stream, outgoing, simulator);
        let server = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("mixer-conn-{}", connection.id()))
            .spawn(move || worker.run(server));
        if let Err(e) = spawned {
            self.client_disconnected(&connection);
            return Err(e.into());
        }
        Ok(())
    }

    /// Register a new connection: send it its id and announce it.
    ///
    /// Returns the connection and the receiving end of its outgoing queue.
    pub fn register_connection(&self, address: SocketAddr) -> (Arc<Connection>, Receiver<Arc<Command>>) {
        let (connection, outgoing) = Connection::new(address);
        self.registry
            .lock()
            .connections
            .insert(connection.id(), connection.clone());

        connection.send_command(Command::new(
            MessageType::ClientId,
            codec::encode_string(&connection.id().to_string()),
        ));
        self.broadcast_client_update(&connection, connection.attributes());
        (connection, outgoing)
    }

    /// Handle one command received from `connection`
    pub fn handle_command(&self, connection: &Arc<Connection>, command: Command) {
        log::trace!("{} <- {}", connection.id(), command.message_type);

        let result = match command.message_type {
            MessageType::JoinRoom => self.join_room(connection, &command),
            MessageType::LeaveRoom => self.leave_room(connection),
            MessageType::ListRooms => self.list_rooms(connection),
            MessageType::DeleteRoom => self.delete_room(connection, &command),
            MessageType::ListAllClients => self.list_all_clients(connection),
            MessageType::SetClientName => self.set_client_name(connection, &command),
            MessageType::SetClientCustomAttributes => {
                self.set_client_custom_attributes(connection, &command)
            }
            MessageType::SetRoomCustomAttributes => {
                self.set_room_custom_attributes(connection, &command)
            }
            MessageType::SetRoomKeepOpen => self.set_room_keep_open(connection, &command),
            MessageType::ClientId => {
                connection.send_command(Command::new(
                    MessageType::ClientId,
                    codec::encode_string(&connection.id().to_string()),
                ));
                Ok(())
            }
            MessageType::Content => self.content_ready(connection),
            t if t.is_room_command() => self.room_command(connection, command),
            t => {
                self.send_error(connection, &format!("Unexpected message type {}", t));
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Malformed command from {}: {}", connection.id(), e);
            self.send_error(connection, &e.to_string());
        }
    }

    /// Send a `SEND_ERROR` to one connection
    pub fn send_error(&self, connection: &Connection, message: &str) {
        log::debug!("Error for {}: {}", connection.id(), message);
        connection.send_command(Command::new(MessageType::SendError, codec::encode_string(message)));
    }

    fn join_room(&self, connection: &Arc<Connection>, command: &Command) -> ProtocolResult<()> {
        let request = JoinRoomRequest::decode(&command.payload)?;
        if let Some(current) = connection.room() {
            self.send_error(connection, &format!("Already in room '{}'", current));
            return Ok(());
        }

        let existing = {
            let mut registry = self.registry.lock();
            let found = registry.rooms.get(&request.room_name).cloned();
            match found {
                Some(room) => {
                    if !room.is_joinable() {
                        drop(registry);
                        self.send_error(
                            connection,
                            &format!("Room '{}' is not joinable yet", request.room_name),
                        );
                        return Ok(());
                    }
                    if let Err(message) = room.check_version(&request) {
                        drop(registry);
                        self.send_error(connection, &message);
                        return Ok(());
                    }
                    room.begin_join();
                    Some(room)
                }
                None => {
                    let room = Arc::new(Room::new(connection, &request, self.policy.clone()));
                    registry.rooms.insert(request.room_name.clone(), room);
                    connection.set_room(Some(request.room_name.clone()));
                    None
                }
            }
        };

        match existing {
            None => {
                log::info!("{} created room '{}'", connection.id(), request.room_name);
                connection.send_command(Command::new(
                    MessageType::JoinRoom,
                    codec::encode_string(&request.room_name),
                ));
                connection.send_command(Command::empty(MessageType::Content));
                if let Some(room) = self.room(&request.room_name) {
                    self.broadcast_room_update(&room, room.attributes());
                }
                self.broadcast_client_update(connection, room_attribute(Some(&request.room_name)));
            }
            Some(room) => match room.add_client(connection) {
                JoinOutcome::Joined { .. } => {
                    connection.set_room(Some(request.room_name.clone()));
                    self.broadcast_client_update(connection, room_attribute(Some(&request.room_name)));
                }
                JoinOutcome::Aborted => self.delete_room_if_unused(&room),
            },
        }
        Ok(())
    }

    fn leave_room(&self, connection: &Arc<Connection>) -> ProtocolResult<()> {
        let Some(name) = connection.room() else {
            self.send_error(connection, "Not in a room");
            return Ok(());
        };

        if let Some(room) = self.room(&name) {
            room.remove_client(connection.id());
            connection.set_room(None);
            connection.send_command(Command::new(MessageType::LeaveRoom, codec::encode_string(&name)));
            self.broadcast_client_update(connection, room_attribute(None));
            self.delete_room_if_unused(&room);
        } else {
            connection.set_room(None);
        }
        log::info!("{} left room '{}'", connection.id(), name);
        Ok(())
    }

    fn list_rooms(&self, connection: &Connection) -> ProtocolResult<()> {
        let rooms: Vec<Arc<Room>> = self.registry.lock().rooms.values().cloned().collect();
        let mut body = Map::new();
        for room in rooms {
            body.insert(room.name().to_string(), Value::Object(room.attributes()));
        }
        connection.send_command(Command::new(MessageType::ListRooms, codec::encode_json(&body)?));
        Ok(())
    }

    fn delete_room(&self, connection: &Connection, command: &Command) -> ProtocolResult<()> {
        let (name, _) = codec::decode_string(&command.payload, 0)?;
        let removed = {
            let mut registry = self.registry.lock();
            let occupied = registry
                .rooms
                .get(&name)
                .map(|room| room.member_count() > 0 || room.join_count() > 0);
            match occupied {
                None => Err(format!("Room '{}' does not exist", name)),
                Some(true) => Err(format!("Room '{}' is not empty", name)),
                Some(false) => {
                    registry.rooms.remove(&name);
                    Ok(())
                }
            }
        };

        match removed {
            Ok(()) => {
                log::info!("Room '{}' deleted by {}", name, connection.id());
                self.broadcast_to_all(Command::new(MessageType::RoomDeleted, codec::encode_string(&name)));
            }
            Err(message) => self.send_error(connection, &message),
        }
        Ok(())
    }

    fn list_all_clients(&self, connection: &Connection) -> ProtocolResult<()> {
        let connections: Vec<Arc<Connection>> =
            self.registry.lock().connections.values().cloned().collect();
        let mut body = Map::new();
        for peer in connections {
            body.insert(peer.id().to_string(), Value::Object(peer.attributes()));
        }
        connection.send_command(Command::new(MessageType::ListAllClients, codec::encode_json(&body)?));
        Ok(())
    }

    fn set_client_name(&self, connection: &Arc<Connection>, command: &Command) -> ProtocolResult<()> {
        let (name, _) = codec::decode_string(&command.payload, 0)?;
        connection.set_name(&name);
        let mut changes = Map::new();
        changes.insert(ClientAttributes::NAME.to_string(), json!(name));
        self.broadcast_client_update(connection, changes);
        Ok(())
    }

    fn set_client_custom_attributes(
        &self,
        connection: &Arc<Connection>,
        command: &Command,
    ) -> ProtocolResult<()> {
        let update = attributes::decode_object(&command.payload)?;
        connection.merge_custom_attributes(&update);
        self.broadcast_client_update(connection, update);
        Ok(())
    }

    fn set_room_custom_attributes(&self, connection: &Connection, command: &Command) -> ProtocolResult<()> {
        let (name, index) = codec::decode_string(&command.payload, 0)?;
        let (update, _): (Map<String, Value>, usize) = codec::decode_json(&command.payload, index)?;
        match self.room(&name) {
            Some(room) => {
                room.merge_custom_attributes(&update);
                self.broadcast_room_update(&room, update);
            }
            None => self.send_error(connection, &format!("Room '{}' does not exist", name)),
        }
        Ok(())
    }

    fn set_room_keep_open(&self, connection: &Connection, command: &Command) -> ProtocolResult<()> {
        let (name, index) = codec::decode_string(&command.payload, 0)?;
        let (keep_open, _) = codec::decode_bool(&command.payload, index)?;
        match self.room(&name) {
            Some(room) => {
                room.set_keep_open(keep_open);
                let mut changes = Map::new();
                changes.insert(RoomAttributes::KEEP_OPEN.to_string(), json!(keep_open));
                self.broadcast_room_update(&room, changes);
                self.delete_room_if_unused(&room);
            }
            None => self.send_error(connection, &format!("Room '{}' does not exist", name)),
        }
        Ok(())
    }

    fn content_ready(&self, connection: &Connection) -> ProtocolResult<()> {
        let room = connection.room().and_then(|name| self.room(&name));
        match room {
            Some(room) if room.creator() == connection.id() => {
                if !room.is_joinable() {
                    room.set_joinable();
                    log::info!("Room '{}' is joinable", room.name());
                    let mut changes = Map::new();
                    changes.insert(RoomAttributes::JOINABLE.to_string(), json!(true));
                    self.broadcast_room_update(&room, changes);
                }
            }
            Some(room) => {
                log::debug!("Ignoring CONTENT from non-creator {} in '{}'", connection.id(), room.name());
            }
            None => self.send_error(connection, "CONTENT received outside of a room"),
        }
        Ok(())
    }

    fn room_command(&self, connection: &Connection, command: Command) -> ProtocolResult<()> {
        let room = connection.room().and_then(|name| self.room(&name));
        let Some(room) = room else {
            self.send_error(
                connection,
                &format!("{} received outside of a room", command.message_type),
            );
            return Ok(());
        };

        if let Some(changes) = room.add_command(Arc::new(command), connection.id()) {
            self.broadcast_room_update(&room, changes);
        }
        Ok(())
    }

    /// Unregister a connection after its worker ended
    pub fn client_disconnected(&self, connection: &Arc<Connection>) {
        connection.close();
        let (known, room) = {
            let mut registry = self.registry.lock();
            let known = registry.connections.remove(&connection.id()).is_some();
            let room = connection
                .room()
                .and_then(|name| registry.rooms.get(&name).cloned());
            (known, room)
        };
        if !known {
            return;
        }

        if let Some(room) = room {
            room.remove_client(connection.id());
            self.delete_room_if_unused(&room);
        }
        log::info!("Client {} disconnected", connection.id());
        self.broadcast_to_all(Command::new(
            MessageType::ClientDisconnected,
            codec::encode_string(&connection.id().to_string()),
        ));
    }

    fn delete_room_if_unused(&self, room: &Arc<Room>) {
        let deleted = {
            let mut registry = self.registry.lock();
            let registered = registry
                .rooms
                .get(room.name())
                .map(|r| Arc::ptr_eq(r, room))
                .unwrap_or(false);
            if registered && room.should_delete() {
                registry.rooms.remove(room.name());
                true
            } else {
                false
            }
        };
        if deleted {
            log::info!("Room '{}' deleted", room.name());
            self.broadcast_to_all(Command::new(
                MessageType::RoomDeleted,
                codec::encode_string(room.name()),
            ));
        }
    }

    fn broadcast_to_all(&self, command: Command) {
        let command = Arc::new(command);
        let registry = self.registry.lock();
        for connection in registry.connections.values() {
            connection.send(command.clone());
        }
    }

    fn broadcast_room_update(&self, room: &Room, changes: Map<String, Value>) {
        self.log_update("Room", room.name(), &changes);
        match attributes::update_command(MessageType::RoomUpdate, room.name(), changes) {
            Ok(command) => self.broadcast_to_all(command),
            Err(e) => log::error!("Failed to encode room update: {}", e),
        }
    }

    fn broadcast_client_update(&self, connection: &Connection, changes: Map<String, Value>) {
        let id = connection.id().to_string();
        self.log_update("Client", &id, &changes);
        match attributes::update_command(MessageType::ClientUpdate, &id, changes) {
            Ok(command) => self.broadcast_to_all(command),
            Err(e) => log::error!("Failed to encode client update: {}", e),
        }
    }

    fn log_update(&self, what: &str, key: &str, changes: &Map<String, Value>) {
        if self.config.log_server_updates {
            log::info!("{} update {}: {}", what, key, Value::Object(changes.clone()));
        } else {
            log::debug!("{} update {}: {}", what, key, Value::Object(changes.clone()));
        }
    }

    /// Look up a room
    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.registry.lock().rooms.get(name).cloned()
    }

    /// Names of all rooms
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }
}

fn room_attribute(room: Option<&str>) -> Map<String, Value> {
    let mut changes = Map::new();
    changes.insert(
        ClientAttributes::ROOM.to_string(),
        room.map(|r| json!(r)).unwrap_or(Value::Null),
    );
    changes
}
