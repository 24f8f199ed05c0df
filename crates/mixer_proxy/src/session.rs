//! Session context
//!
//! Everything a peer needs while connected to a room: the proxy state, the
//! deferred operation queue and the last observed interaction mode. Created
//! on join and dropped on leave.

use crate::changeset::{Changeset, Rename};
use crate::deferred::{DeferredQueue, RemoteOp};
use crate::document::{Document, InteractionMode};
use crate::error::ProxyResult;
use crate::state::{DiffConfig, ProxyState};

/// Per-room synchronization state
#[derive(Debug)]
pub struct SessionContext {
    state: ProxyState,
    deferred: DeferredQueue,
    mode: InteractionMode,
    client_id: Option<String>,
    room: String,
}

impl SessionContext {
    /// Create the context of a room
    pub fn new(room: impl Into<String>) -> Self {
        Self::with_config(room, DiffConfig::default())
    }

    /// Create the context of a room with diff options
    pub fn with_config(room: impl Into<String>, config: DiffConfig) -> Self {
        Self {
            state: ProxyState::with_config(config),
            deferred: DeferredQueue::new(),
            mode: InteractionMode::default(),
            client_id: None,
            room: room.into(),
        }
    }

    /// Set the client id assigned by the server (builder pattern)
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Room name
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Client id assigned by the server
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Set the client id
    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.client_id = Some(client_id.into());
    }

    /// Proxy state
    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Mutable proxy state
    pub fn state_mut(&mut self) -> &mut ProxyState {
        &mut self.state
    }

    /// Last observed interaction mode
    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    /// Number of operations waiting for a safe mode
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Compute local changes and record them in the proxies
    pub fn collect_local_changes(&mut self, doc: &mut Document) -> Changeset {
        let changeset = self.state.diff(doc);
        self.state.apply_local(&changeset, doc);
        changeset
    }

    /// Apply a remote operation now, or queue it if the editor is in an
    /// unsafe mode.
    ///
    /// Returns the corrective renames to broadcast, including those
    /// produced by a drain triggered by a mode change.
    pub fn submit(&mut self, op: RemoteOp, doc: &mut Document) -> ProxyResult<Vec<Rename>> {
        let mut corrective = self.refresh_mode(doc);
        if !self.mode.is_safe() {
            self.deferred.push(op);
            return Ok(corrective);
        }
        corrective.extend(self.apply_op(op, doc)?);
        self.state.resolve_all_pending(doc);
        Ok(corrective)
    }

    /// Submit every operation of a received changeset.
    ///
    /// Failing operations are logged and skipped.
    pub fn submit_changeset(&mut self, changeset: Changeset, doc: &mut Document) -> Vec<Rename> {
        let mut corrective = Vec::new();
        for op in RemoteOp::from_changeset(changeset) {
            let label = op.label();
            match self.submit(op, doc) {
                Ok(renames) => corrective.extend(renames),
                Err(e) => log::warn!("Skipping remote {}: {}", label, e),
            }
        }
        corrective
    }

    /// Switch the editor mode. Leaving an unsafe mode applies the queued
    /// operations, exactly once.
    pub fn set_mode(&mut self, mode: InteractionMode, doc: &mut Document) -> Vec<Rename> {
        doc.set_mode(mode);
        self.refresh_mode(doc)
    }

    /// Observe the editor mode, draining the queue on a transition back to
    /// a safe mode
    pub fn refresh_mode(&mut self, doc: &mut Document) -> Vec<Rename> {
        let previous = self.mode;
        self.mode = doc.mode();
        if previous.is_safe() || !self.mode.is_safe() {
            return Vec::new();
        }
        self.drain_deferred(doc)
    }

    fn drain_deferred(&mut self, doc: &mut Document) -> Vec<Rename> {
        let ops = self.deferred.drain();
        if ops.is_empty() {
            return Vec::new();
        }
        log::info!("Applying {} deferred remote operations", ops.len());

        let mut corrective = Vec::new();
        for op in ops {
            let label = op.label();
            match self.apply_op(op, doc) {
                Ok(renames) => corrective.extend(renames),
                Err(e) => log::warn!("Skipping deferred {}: {}", label, e),
            }
        }
        self.state.resolve_all_pending(doc);
        corrective
    }

    fn apply_op(&mut self, op: RemoteOp, doc: &mut Document) -> ProxyResult<Vec<Rename>> {
        match op {
            RemoteOp::Create(proxy) => self.state.create_datablock(proxy, doc).map(|_| Vec::new()),
            RemoteOp::Update(change) => self.state.update_datablock(&change, doc).map(|_| Vec::new()),
            RemoteOp::Remove(uuid) => self.state.remove_datablock(uuid, doc).map(|_| Vec::new()),
            RemoteOp::Rename(renames) => Ok(self.state.rename_datablocks(&renames, doc)),
        }
    }

    /// Forget every proxy and queued operation and empty the document
    pub fn clear(&mut self, doc: &mut Document) {
        self.state.clear();
        self.deferred.clear();
        doc.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::LiveNode;
    use crate::id::NodeKind;
    use crate::value::Value;

    fn origin() -> (SessionContext, Document) {
        let mut doc = Document::new();
        doc.insert_node(LiveNode::new(NodeKind::Object, "Cube").with_attribute("visible", true));
        (SessionContext::new("studio"), doc)
    }

    #[test]
    fn test_client_id() {
        let context = SessionContext::new("studio").with_client_id("abc");
        assert_eq!(context.room(), "studio");
        assert_eq!(context.client_id(), Some("abc"));
    }

    #[test]
    fn test_safe_mode_applies_immediately() {
        let (mut origin, mut origin_doc) = origin();
        let changeset = origin.collect_local_changes(&mut origin_doc);

        let mut peer = SessionContext::new("studio");
        let mut doc = Document::new();
        let corrective = peer.submit_changeset(changeset, &mut doc);

        assert!(corrective.is_empty());
        assert_eq!(doc.len(), 1);
        assert_eq!(peer.state().len(), 1);
    }

    #[test]
    fn test_unsafe_mode_defers_until_safe() {
        let (mut origin, mut origin_doc) = origin();
        let creation = origin.collect_local_changes(&mut origin_doc);

        let handle = origin_doc.find_by_name(NodeKind::Object, "Cube").unwrap();
        origin_doc.get_mut(handle).unwrap().attributes.insert("visible".into(), false.into());
        let update = origin.collect_local_changes(&mut origin_doc);

        let mut peer = SessionContext::new("studio");
        let mut doc = Document::new();
        peer.set_mode(InteractionMode::Edit, &mut doc);
        peer.submit_changeset(creation, &mut doc);
        peer.submit_changeset(update, &mut doc);

        assert!(doc.is_empty());
        assert_eq!(peer.deferred_len(), 2);

        peer.set_mode(InteractionMode::Object, &mut doc);
        assert_eq!(peer.deferred_len(), 0);
        let cube = doc.find_by_name(NodeKind::Object, "Cube").unwrap();
        assert_eq!(doc.get(cube).unwrap().attributes.get("visible"), Some(&Value::Bool(false)));

        // A second transition finds nothing left to apply
        peer.set_mode(InteractionMode::Edit, &mut doc);
        peer.set_mode(InteractionMode::Object, &mut doc);
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_mode_change_observed_on_submit() {
        let (mut origin, mut origin_doc) = origin();
        let creation = origin.collect_local_changes(&mut origin_doc);

        let mut peer = SessionContext::new("studio");
        let mut doc = Document::new();
        doc.set_mode(InteractionMode::Edit);
        peer.submit_changeset(creation, &mut doc);
        assert_eq!(peer.deferred_len(), 1);

        doc.set_mode(InteractionMode::Object);
        assert!(peer.refresh_mode(&mut doc).is_empty());
        assert_eq!(peer.deferred_len(), 0);
        assert_eq!(doc.len(), 1);

        assert!(peer.refresh_mode(&mut doc).is_empty());
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_clear() {
        let (mut context, mut doc) = origin();
        context.collect_local_changes(&mut doc);
        context.clear(&mut doc);
        assert!(context.state().is_empty());
        assert!(doc.is_empty());
    }
}
