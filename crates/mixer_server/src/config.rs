//! Server configuration
//!
//! Built from command line flags by the `mixer-server` binary. There is no
//! configuration file.

use std::collections::HashSet;
use std::time::Duration;

use mixer_protocol::{MessageType, DEFAULT_PORT};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on
    pub host: String,
    /// TCP port to listen on
    pub port: u16,
    /// Simulated outgoing bandwidth per connection, in Mbit/s
    pub bandwidth_mbps: Option<f64>,
    /// Simulated latency added before each outgoing command
    pub latency: Option<Duration>,
    /// Log every room and client attribute broadcast at info level
    pub log_server_updates: bool,
    /// Late join finalizes once the remaining backlog is at most this long
    pub join_batch_threshold: usize,
    /// Room commands that are broadcast but never stored in the room log
    pub non_durable: HashSet<MessageType>,
    /// Socket read timeout of connection workers
    pub poll_interval: Duration,
}

impl ServerConfig {
    /// Default set of non-durable message types (time cursor traffic)
    pub fn default_non_durable() -> HashSet<MessageType> {
        [MessageType::Frame, MessageType::Play, MessageType::Pause]
            .into_iter()
            .collect()
    }

    /// Address string to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Configuration for tests: ephemeral port on loopback, fast polling
    pub fn local_ephemeral() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            poll_interval: Duration::from_millis(2),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            bandwidth_mbps: None,
            latency: None,
            log_server_updates: false,
            join_batch_threshold: 64,
            non_durable: Self::default_non_durable(),
            poll_interval: Duration::from_millis(10),
        }
    }
}
