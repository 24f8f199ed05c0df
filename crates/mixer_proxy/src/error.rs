//! Error types

use thiserror::Error;

use crate::handle::LiveHandle;
use crate::id::NodeUuid;

/// Live document errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Stale handle: {0:?}")]
    StaleHandle(LiveHandle),

    #[error("Node '{name}' is still referenced by '{referrer}'")]
    StillReferenced { name: String, referrer: String },

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Nothing to redo")]
    NothingToRedo,
}

/// Errors that abort the creation of a live node from a proxy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreationError {
    #[error("External file not available: {0}")]
    MissingExternalFile(String),

    #[error("Datablock {0} already exists")]
    DuplicateUuid(NodeUuid),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Proxy state errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Unknown datablock: {0}")]
    UnknownUuid(NodeUuid),

    #[error("Creation failed: {0}")]
    Creation(#[from] CreationError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Invalid buffer: {0}")]
    Buffer(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;
pub type ProxyResult<T> = Result<T, ProxyError>;
