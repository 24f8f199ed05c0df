//! `mixer-server`: room broadcast server
//!
//! ```text
//! mixer-server --port 12800 --latency 50 --bandwidth 10 --log-server-updates
//! ```

use std::collections::HashSet;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use mixer_protocol::{MessageType, DEFAULT_PORT};
use mixer_server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "mixer-server")]
#[command(about = "Room broadcast server for collaborative scene editing", long_about = None)]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "MIXER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// TCP port to listen on
    #[arg(short, long, env = "MIXER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Simulated bandwidth per connection in Mbit/s
    #[arg(long, env = "MIXER_BANDWIDTH")]
    bandwidth: Option<f64>,

    /// Simulated latency per command in milliseconds
    #[arg(long, env = "MIXER_LATENCY")]
    latency: Option<u64>,

    /// Log every room and client attribute update at info level
    #[arg(long, env = "MIXER_LOG_SERVER_UPDATES")]
    log_server_updates: bool,

    /// Room commands broadcast but not logged, comma separated ("none" for an empty set)
    #[arg(long, env = "MIXER_NON_DURABLE", value_delimiter = ',')]
    non_durable: Option<Vec<String>>,

    /// Late join batch threshold, in commands
    #[arg(long, env = "MIXER_JOIN_BATCH", default_value_t = 64)]
    join_batch_threshold: usize,
}

fn parse_non_durable(names: &[String]) -> Result<HashSet<MessageType>, String> {
    let mut types = HashSet::new();
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        if name.eq_ignore_ascii_case("none") {
            continue;
        }
        let message_type = MessageType::from_str(name).map_err(|e| e.to_string())?;
        if !message_type.is_room_command() {
            return Err(format!("{} is not a room command", message_type));
        }
        types.insert(message_type);
    }
    Ok(types)
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, String> {
        let non_durable = match &self.non_durable {
            Some(names) => parse_non_durable(names)?,
            None => ServerConfig::default_non_durable(),
        };
        Ok(ServerConfig {
            host: self.host,
            port: self.port,
            bandwidth_mbps: self.bandwidth,
            latency: self.latency.map(Duration::from_millis),
            log_server_updates: self.log_server_updates,
            join_batch_threshold: self.join_batch_threshold,
            non_durable,
            ..ServerConfig::default()
        })
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid arguments: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Starting mixer-server on {} (non-durable: {:?})",
        config.bind_address(),
        config.non_durable
    );

    let server = Server::new(config);
    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let signal_server = server.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        signal_server.shutdown();
    }) {
        log::warn!("Failed to set signal handler: {}", e);
    }

    match server.run(listener) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_non_durable() {
        let names = vec!["frame".to_string(), "TRANSFORM".to_string()];
        let types = parse_non_durable(&names).unwrap();
        assert!(types.contains(&MessageType::Frame));
        assert!(types.contains(&MessageType::Transform));
    }

    #[test]
    fn test_parse_non_durable_none() {
        assert!(parse_non_durable(&["none".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_non_durable_rejects_control() {
        assert!(parse_non_durable(&["join_room".to_string()]).is_err());
    }

    #[test]
    fn test_args_defaults() {
        let config = Args::parse_from(["mixer-server"]).into_config().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.non_durable, ServerConfig::default_non_durable());
        assert!(config.latency.is_none());
    }
}
