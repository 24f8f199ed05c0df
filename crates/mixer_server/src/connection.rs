//! Peer connections
//!
//! A [`Connection`] is the shared half of a peer: the server, rooms and other
//! workers hold an `Arc<Connection>` to enqueue outgoing commands and read its
//! attributes. The socket itself is owned by a [`ConnectionWorker`] running on
//! its own thread.
//!
//! # Worker Loop
//!
//! 1. Read from the socket with a short timeout and feed the frame decoder
//! 2. Dispatch every complete command to the server
//! 3. Drain the outgoing queue to the socket
//! 4. Stop on I/O failure, peer shutdown, `close()` or server shutdown

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use mixer_protocol::{attributes, ClientAttributes, Command, FrameDecoder};

use crate::server::Server;
use crate::simulation::NetworkSimulator;

/// Unique identifier of a connected peer, shown to clients as a uuid string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying uuid
    pub fn raw(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable per-peer state
#[derive(Debug, Default)]
struct ConnectionState {
    /// Room the peer is a member of
    room: Option<String>,
    /// Custom attributes set by the peer, including its display name
    custom_attributes: Map<String, Value>,
}

/// Traffic counters
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands received from the peer
    pub commands_received: AtomicU64,
    /// Commands written to the peer
    pub commands_sent: AtomicU64,
    /// Bytes received from the peer
    pub bytes_received: AtomicU64,
    /// Bytes written to the peer
    pub bytes_sent: AtomicU64,
}

/// Shared handle of a connected peer
#[derive(Debug)]
pub struct Connection {
    /// Unique id
    id: ConnectionId,
    /// Peer address
    address: SocketAddr,
    /// Outgoing queue, drained by the worker
    outgoing: Sender<Arc<Command>>,
    /// Set once the connection must stop
    closed: AtomicBool,
    /// Room membership and attributes
    state: Mutex<ConnectionState>,
    /// Traffic counters
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection and the receiving end of its outgoing queue
    pub fn new(address: SocketAddr) -> (Arc<Self>, Receiver<Arc<Command>>) {
        let (outgoing, receiver) = unbounded();
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            address,
            outgoing,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::default()),
            stats: ConnectionStats::default(),
        });
        (connection, receiver)
    }

    /// Get the connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the peer address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Enqueue a command. Ignored once closed.
    pub fn send(&self, command: Arc<Command>) {
        if self.is_closed() {
            return;
        }
        if self.outgoing.send(command).is_err() {
            log::debug!("Outgoing queue of {} is gone", self.id);
        }
    }

    /// Enqueue an owned command
    pub fn send_command(&self, command: Command) {
        self.send(Arc::new(command));
    }

    /// Request the worker to stop
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the connection is closed or closing
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Room the peer is in
    pub fn room(&self) -> Option<String> {
        self.state.lock().room.clone()
    }

    /// Set or clear the room
    pub fn set_room(&self, room: Option<String>) {
        self.state.lock().room = room;
    }

    /// Set the display name
    pub fn set_name(&self, name: &str) {
        self.state
            .lock()
            .custom_attributes
            .insert(ClientAttributes::NAME.to_string(), json!(name));
    }

    /// Merge custom attributes
    pub fn merge_custom_attributes(&self, update: &Map<String, Value>) {
        attributes::merge_into(&mut self.state.lock().custom_attributes, update);
    }

    /// Full attribute map: well-known keys plus custom ones
    pub fn attributes(&self) -> Map<String, Value> {
        let state = self.state.lock();
        let mut map = state.custom_attributes.clone();
        map.insert(ClientAttributes::ID.to_string(), json!(self.id.to_string()));
        map.insert(
            ClientAttributes::IP.to_string(),
            json!(self.address.ip().to_string()),
        );
        map.insert(ClientAttributes::PORT.to_string(), json!(self.address.port()));
        map.insert(
            ClientAttributes::ROOM.to_string(),
            state.room.as_ref().map(|r| json!(r)).unwrap_or(Value::Null),
        );
        map
    }

    /// Traffic counters
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

/// Owner of the socket of one connection
pub struct ConnectionWorker {
    connection: Arc<Connection>,
    stream: TcpStream,
    outgoing: Receiver<Arc<Command>>,
    decoder: FrameDecoder,
    simulator: NetworkSimulator,
}

impl ConnectionWorker {
    /// Create a worker for an accepted stream
    pub fn new(
        connection: Arc<Connection>,
        stream: TcpStream,
        outgoing: Receiver<Arc<Command>>,
        simulator: NetworkSimulator,
    ) -> Self {
        Self {
            connection,
            stream,
            outgoing,
            decoder: FrameDecoder::new(),
            simulator,
        }
    }

    /// Run until the connection ends, then unregister it
    pub fn run(mut self, server: Arc<Server>) {
        let id = self.connection.id();
        if let Err(e) = self.stream.set_read_timeout(Some(server.config().poll_interval)) {
            log::error!("Failed to configure socket of {}: {}", id, e);
            server.client_disconnected(&self.connection);
            return;
        }
        if let Err(e) = self.stream.set_nodelay(true) {
            log::debug!("Could not disable Nagle on {}: {}", id, e);
        }

        let mut buffer = vec![0u8; 64 * 1024];
        while !self.connection.is_closed() && !server.is_shutting_down() {
            if !self.read_incoming(&server, &mut buffer) {
                break;
            }
            if !self.flush_outgoing() {
                break;
            }
        }

        // Best effort: deliver what is already queued (errors, acks)
        self.flush_outgoing();
        server.client_disconnected(&self.connection);
        log::info!("Connection {} ({}) ended", id, self.connection.address());
    }

    /// Read once and dispatch complete commands. Returns false when the
    /// connection must end.
    fn read_incoming(&mut self, server: &Arc<Server>, buffer: &mut [u8]) -> bool {
        let count = match self.stream.read(buffer) {
            Ok(0) => {
                log::debug!("Peer {} closed the connection", self.connection.id());
                return false;
            }
            Ok(count) => count,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return true;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return true,
            Err(e) => {
                log::warn!("Read error on {}: {}", self.connection.id(), e);
                return false;
            }
        };

        self.connection
            .stats
            .bytes_received
            .fetch_add(count as u64, Ordering::Relaxed);
        self.decoder.feed(&buffer[..count]);

        loop {
            match self.decoder.next_frame() {
                Ok(Some(command)) => {
                    self.connection
                        .stats
                        .commands_received
                        .fetch_add(1, Ordering::Relaxed);
                    server.handle_command(&self.connection, command);
                }
                Ok(None) => return true,
                Err(e) if e.is_recoverable() => {
                    log::warn!("Bad command from {}: {}", self.connection.id(), e);
                    server.send_error(&self.connection, &e.to_string());
                }
                Err(e) => {
                    log::error!("Dropping connection {}: {}", self.connection.id(), e);
                    return false;
                }
            }
        }
    }

    /// Write every queued command. Returns false on write failure.
    fn flush_outgoing(&mut self) -> bool {
        while let Ok(command) = self.outgoing.try_recv() {
            self.simulator.wait(command.byte_size());
            if let Err(e) = command.write_to(&mut self.stream) {
                log::warn!("Write error on {}: {}", self.connection.id(), e);
                return false;
            }
            self.connection.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
            self.connection
                .stats
                .bytes_sent
                .fetch_add(command.byte_size() as u64, Ordering::Relaxed);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixer_protocol::MessageType;

    fn address() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_connection_ids_unique() {
        let (a, _ra) = Connection::new(address());
        let (b, _rb) = Connection::new(address());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_send_and_close() {
        let (connection, receiver) = Connection::new(address());
        connection.send_command(Command::empty(MessageType::ClientId));
        assert_eq!(receiver.len(), 1);

        connection.close();
        connection.send_command(Command::empty(MessageType::ClientId));
        assert_eq!(receiver.len(), 1);
        assert!(connection.is_closed());
    }

    #[test]
    fn test_attributes() {
        let (connection, _receiver) = Connection::new(address());
        connection.set_name("alice");
        connection.set_room(Some("studio".into()));
        let mut custom = Map::new();
        custom.insert("color".into(), json!([1, 0, 0]));
        connection.merge_custom_attributes(&custom);

        let attrs = connection.attributes();
        assert_eq!(attrs["name"], json!("alice"));
        assert_eq!(attrs["room"], json!("studio"));
        assert_eq!(attrs["ip"], json!("127.0.0.1"));
        assert_eq!(attrs["port"], json!(4000));
        assert_eq!(attrs["color"], json!([1, 0, 0]));
        assert_eq!(attrs["id"], json!(connection.id().to_string()));
    }

    #[test]
    fn test_room_cleared() {
        let (connection, _receiver) = Connection::new(address());
        connection.set_room(Some("studio".into()));
        connection.set_room(None);
        assert_eq!(connection.attributes()["room"], Value::Null);
    }
}
