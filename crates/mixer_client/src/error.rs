//! Client errors

use thiserror::Error;

use mixer_protocol::ProtocolError;
use mixer_proxy::ProxyError;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to {address} failed: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
