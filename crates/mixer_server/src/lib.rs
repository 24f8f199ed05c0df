//! # Mixer Server
//!
//! Room-based broadcast hub for collaborative editing sessions.
//!
//! ## Architecture
//!
//! ```text
//! +-----------+        +----------------------------+        +-----------+
//! | Client A  |<------>|  Server (room registry)    |<------>| Client B  |
//! +-----------+        |   Room "studio"            |        +-----------+
//!                      |    - ordered command log   |
//!                      |    - members               |
//!                      +----------------------------+
//! ```
//!
//! - [`Server`] owns the registries of rooms and connections behind one lock
//!   and routes control commands.
//! - [`Room`] owns an append-only command log; it merges superseded
//!   high-frequency commands, broadcasts new commands to the other members and
//!   replays the log to late joiners.
//! - [`Connection`] is one peer; a worker thread reads its socket and drains
//!   its outgoing queue.
//!
//! All state lives in memory and is lost when the process exits.

pub mod config;
pub mod connection;
pub mod room;
pub mod server;
pub mod simulation;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId};
pub use room::{JoinOutcome, Room, RoomPolicy};
pub use server::Server;
pub use simulation::NetworkSimulator;

use mixer_protocol::ProtocolError;
use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
