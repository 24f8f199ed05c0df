//! # Mixer Proxy
//!
//! Client-side mirror of a shared scene document and the diff engine that
//! keeps peers in sync.
//!
//! The live [`Document`] is what the local editor mutates. [`ProxyState`]
//! holds one [`DatablockProxy`] per synchronized node: its last known state,
//! with every cross-node reference expressed as a [`NodeUuid`]. Diffing the
//! document against the proxies yields a [`Changeset`]; applying a received
//! changeset writes both the proxies and the document.
//!
//! ## Usage
//!
//! ```ignore
//! use mixer_proxy::{Document, SessionContext};
//!
//! let mut context = SessionContext::new("studio");
//! let changeset = context.collect_local_changes(&mut doc);
//! // ... send changeset, receive remote ones ...
//! let corrective = context.submit_changeset(received, &mut doc);
//! ```

pub mod changeset;
pub mod deferred;
pub mod delta;
pub mod document;
pub mod error;
pub mod handle;
pub mod id;
pub mod proxy;
pub mod rename;
pub mod session;
pub mod state;
pub mod undo;
pub mod value;

pub use changeset::{Changeset, Removal, Rename};
pub use deferred::{DeferredQueue, RemoteOp};
pub use delta::{BufferDelta, DatablockDelta, MediaDelta, StructDelta, ValueDelta};
pub use document::{Document, InteractionMode, LiveNode, DEFAULT_MAX_UNDO_STEPS};
pub use error::{CreationError, DocumentError, DocumentResult, ProxyError, ProxyResult};
pub use handle::LiveHandle;
pub use id::{NodeKind, NodeUuid};
pub use proxy::{DatablockProxy, Materialized, FILEPATH_KEY};
pub use rename::fallback_name;
pub use session::SessionContext;
pub use state::{ApplyReport, ApplyTarget, DiffConfig, ProxyState, SanityReport};
pub use undo::{UndoReport, UndoSnapshot};
pub use value::{Media, SoaBuffer, SoaElement, Value, COMPRESSION_THRESHOLD};

/// Object attributes carried by `TRANSFORM` messages
pub const TRANSFORM_KEYS: [&str; 3] = ["location", "rotation", "scale"];
