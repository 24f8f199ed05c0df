//! Client configuration

use std::time::Duration;

use mixer_protocol::{DEFAULT_HOST, DEFAULT_PORT, PROTOCOL_VERSION};

/// Connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Socket read timeout; bounds how long a fetch blocks
    pub read_timeout: Duration,
    /// Host engine version, compared by rooms on join
    pub engine_version: String,
    /// Protocol version, compared by rooms on join
    pub protocol_version: String,
    /// Accept peers with other versions when creating a room
    pub ignore_version_check: bool,
}

impl ClientConfig {
    /// Settings for a server address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the engine version (builder pattern)
    pub fn with_engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = version.into();
        self
    }

    /// Address string to connect to
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_timeout: Duration::from_millis(10),
            engine_version: "unknown".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            ignore_version_check: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.address(), "localhost:12800");
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("127.0.0.1", 4000).with_engine_version("3.6");
        assert_eq!(config.address(), "127.0.0.1:4000");
        assert_eq!(config.engine_version, "3.6");
    }
}
