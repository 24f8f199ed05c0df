//! # Mixer Client
//!
//! Connects a local [`Document`](mixer_proxy::Document) to a room of the
//! broadcast server.
//!
//! - [`Client`]: blocking TCP connection, room requests and caches of the
//!   room and client attributes broadcast by the server
//! - [`wire`]: changesets to commands and back
//! - [`SyncSession`]: the join sequence, application of received commands
//!   and emission of local changes
//!
//! ## Usage
//!
//! ```ignore
//! use mixer_client::{Client, ClientConfig, SyncSession};
//!
//! let mut client = Client::connect(ClientConfig::default())?;
//! client.join_room("studio")?;
//! let mut session = SyncSession::new("studio");
//! loop {
//!     // ... the editor mutates doc ...
//!     session.run_network_step(&mut client, &mut doc)?;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod wire;

pub use client::{Client, ClientState, ClientStats};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use session::{SessionStats, SyncSession};
pub use wire::Transform;
