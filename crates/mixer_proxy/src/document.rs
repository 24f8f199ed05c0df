//! Live document
//!
//! An arena of [`LiveNode`]s addressed by [`LiveHandle`]. Names are unique
//! per kind: creating or renaming onto a taken name picks the next free
//! `Name.001`-style variant, the way the host editor does.
//!
//! Cross-node references are [`Value::Node`] handles; the document refuses
//! to remove a node that is still referenced.
//!
//! ## Undo
//!
//! [`Document::push_undo_step`] records the whole document. Undo and redo
//! rebuild every node under a fresh handle with references remapped, so all
//! handles held before the step go stale. Uuid tags survive.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{DocumentError, DocumentResult};
use crate::handle::{LiveHandle, Slots};
use crate::id::{NodeKind, NodeUuid};
use crate::value::{Media, SoaBuffer, Value};

/// Interaction mode of the local editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InteractionMode {
    /// Whole-object editing, remote changes can be applied
    #[default]
    Object,
    /// Fine-grained sub-component editing, remote changes must wait
    Edit,
}

impl InteractionMode {
    /// Whether remote changes may be applied in this mode
    pub fn is_safe(&self) -> bool {
        matches!(self, InteractionMode::Object)
    }
}

/// A node of the live document
#[derive(Debug, Clone, PartialEq)]
pub struct LiveNode {
    /// Kind of datablock
    pub kind: NodeKind,
    /// Unique name within the kind, changed through [`Document::rename`]
    name: String,
    /// Synchronization tag
    uuid: Option<NodeUuid>,
    /// Scalar and structured attributes
    pub attributes: BTreeMap<String, Value>,
    /// Bulk numeric buffers
    pub buffers: BTreeMap<String, SoaBuffer>,
    /// Embedded media payload
    pub media: Option<Media>,
}

impl LiveNode {
    /// Create an empty node
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            uuid: None,
            attributes: BTreeMap::new(),
            buffers: BTreeMap::new(),
            media: None,
        }
    }

    /// Set an attribute (builder pattern)
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set a buffer (builder pattern)
    pub fn with_buffer(mut self, key: impl Into<String>, buffer: SoaBuffer) -> Self {
        self.buffers.insert(key.into(), buffer);
        self
    }

    /// Set the media payload (builder pattern)
    pub fn with_media(mut self, media: Media) -> Self {
        self.media = Some(media);
        self
    }

    /// Current name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Synchronization tag
    pub fn uuid(&self) -> Option<NodeUuid> {
        self.uuid
    }

    /// Handles referenced by the attributes
    pub fn references(&self) -> Vec<LiveHandle> {
        let mut out = Vec::new();
        for value in self.attributes.values() {
            value.node_refs(&mut out);
        }
        out
    }

    /// Whether any attribute references `target`
    pub fn references_node(&self, target: LiveHandle) -> bool {
        self.references().contains(&target)
    }
}

/// Recorded document state for undo/redo
#[derive(Debug, Clone)]
struct UndoStep {
    nodes: Vec<(LiveHandle, LiveNode)>,
}

/// Undo steps kept by default, oldest dropped first
pub const DEFAULT_MAX_UNDO_STEPS: usize = 64;

/// The local editable document
#[derive(Debug)]
pub struct Document {
    nodes: Slots<LiveNode>,
    names: HashMap<(NodeKind, String), LiveHandle>,
    mode: InteractionMode,
    external_files: HashSet<String>,
    undo_stack: Vec<UndoStep>,
    redo_stack: Vec<UndoStep>,
    max_undo_steps: usize,
}

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Self {
            nodes: Slots::new(),
            names: HashMap::new(),
            mode: InteractionMode::Object,
            external_files: HashSet::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_undo_steps: DEFAULT_MAX_UNDO_STEPS,
        }
    }

    /// Limit the undo history (builder pattern)
    pub fn with_max_undo_steps(mut self, max: usize) -> Self {
        self.max_undo_steps = max.max(1);
        self
    }

    /// Create an empty node, returning its handle. The name may be altered to
    /// stay unique.
    pub fn create_node(&mut self, kind: NodeKind, name: &str) -> LiveHandle {
        self.insert_node(LiveNode::new(kind, name))
    }

    /// Insert a node, returning its handle. The name may be altered to stay
    /// unique.
    pub fn insert_node(&mut self, mut node: LiveNode) -> LiveHandle {
        node.name = self.unique_name(node.kind, &node.name, None);
        let key = (node.kind, node.name.clone());
        let handle = self.nodes.insert(node);
        self.names.insert(key, handle);
        handle
    }

    /// Remove a node. Fails if another node still references it.
    pub fn remove_node(&mut self, handle: LiveHandle) -> DocumentResult<LiveNode> {
        let node = self.nodes.get(handle).ok_or(DocumentError::StaleHandle(handle))?;
        if let Some(referrer) = self.referrers_of(handle).first() {
            let referrer = self.nodes.get(*referrer).map(|n| n.name.clone()).unwrap_or_default();
            return Err(DocumentError::StillReferenced {
                name: node.name.clone(),
                referrer,
            });
        }

        let node = self.nodes.remove(handle).ok_or(DocumentError::StaleHandle(handle))?;
        self.names.remove(&(node.kind, node.name.clone()));
        Ok(node)
    }

    /// Nodes whose attributes reference `target`
    pub fn referrers_of(&self, target: LiveHandle) -> Vec<LiveHandle> {
        self.nodes
            .iter()
            .filter(|(handle, node)| *handle != target && node.references_node(target))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Drop every reference to `target`: list items are removed, other
    /// positions become null. Returns the number of nodes changed.
    pub fn unlink_references_to(&mut self, target: LiveHandle) -> usize {
        let mut changed = 0;
        for (handle, node) in self.nodes.iter_mut() {
            if handle == target || !node.references_node(target) {
                continue;
            }
            for value in node.attributes.values_mut() {
                *value = value.map_node_refs(&mut |h| (h != target).then_some(Value::Node(h)));
            }
            changed += 1;
        }
        changed
    }

    /// Rename a node, returning the effective (unique) name
    pub fn rename(&mut self, handle: LiveHandle, name: &str) -> DocumentResult<String> {
        let node = self.nodes.get(handle).ok_or(DocumentError::StaleHandle(handle))?;
        if node.name == name {
            return Ok(name.to_string());
        }
        let kind = node.kind;
        let old_key = (kind, node.name.clone());
        let effective = self.unique_name(kind, name, Some(handle));

        self.names.remove(&old_key);
        self.names.insert((kind, effective.clone()), handle);
        if let Some(node) = self.nodes.get_mut(handle) {
            node.name = effective.clone();
        }
        Ok(effective)
    }

    /// First free name for `kind`, based on `wanted`
    fn unique_name(&self, kind: NodeKind, wanted: &str, owner: Option<LiveHandle>) -> String {
        let is_free = |name: &str| match self.names.get(&(kind, name.to_string())) {
            None => true,
            Some(h) => Some(*h) == owner,
        };
        if is_free(wanted) {
            return wanted.to_string();
        }

        let base = strip_numeric_suffix(wanted);
        (1..)
            .map(|n| format!("{}.{:03}", base, n))
            .find(|candidate| is_free(candidate))
            .unwrap_or_else(|| wanted.to_string())
    }

    /// Get a node
    pub fn get(&self, handle: LiveHandle) -> Option<&LiveNode> {
        self.nodes.get(handle)
    }

    /// Get a node mutably. Renaming must go through [`Document::rename`].
    pub fn get_mut(&mut self, handle: LiveHandle) -> Option<&mut LiveNode> {
        self.nodes.get_mut(handle)
    }

    /// Whether a handle is live
    pub fn contains(&self, handle: LiveHandle) -> bool {
        self.nodes.get(handle).is_some()
    }

    /// Find a node by kind and name
    pub fn find_by_name(&self, kind: NodeKind, name: &str) -> Option<LiveHandle> {
        self.names.get(&(kind, name.to_string())).copied()
    }

    /// Find a node by uuid tag
    pub fn find_by_uuid(&self, uuid: NodeUuid) -> Option<LiveHandle> {
        self.nodes
            .iter()
            .find(|(_, node)| node.uuid == Some(uuid))
            .map(|(handle, _)| handle)
    }

    /// Iterate over nodes in slot order
    pub fn iter(&self) -> impl Iterator<Item = (LiveHandle, &LiveNode)> {
        self.nodes.iter()
    }

    /// All live handles in slot order
    pub fn handles(&self) -> Vec<LiveHandle> {
        self.nodes.iter().map(|(handle, _)| handle).collect()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the document is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tag a node with a uuid
    pub fn set_uuid(&mut self, handle: LiveHandle, uuid: NodeUuid) -> DocumentResult<()> {
        let node = self.nodes.get_mut(handle).ok_or(DocumentError::StaleHandle(handle))?;
        node.uuid = Some(uuid);
        Ok(())
    }

    /// Uuid tag of a node
    pub fn uuid_of(&self, handle: LiveHandle) -> Option<NodeUuid> {
        self.nodes.get(handle).and_then(|node| node.uuid)
    }

    /// Map of every uuid tag to its node
    pub fn uuid_index(&self) -> HashMap<NodeUuid, LiveHandle> {
        self.nodes
            .iter()
            .filter_map(|(handle, node)| node.uuid.map(|uuid| (uuid, handle)))
            .collect()
    }

    /// Remove all nodes and undo history
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.names.clear();
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Make an external file loadable
    pub fn add_external_file(&mut self, path: impl Into<String>) {
        self.external_files.insert(path.into());
    }

    /// Whether an external file is available
    pub fn has_external_file(&self, path: &str) -> bool {
        self.external_files.contains(path)
    }

    /// Current interaction mode
    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    /// Switch interaction mode. Remote changes queued during an unsafe mode
    /// are applied by the session when it observes the transition.
    pub fn set_mode(&mut self, mode: InteractionMode) {
        self.mode = mode;
    }

    /// Record the current state as an undo step
    pub fn push_undo_step(&mut self) {
        let step = self.capture();
        self.push_undo(step);
        self.redo_stack.clear();
    }

    /// Restore the last undo step
    pub fn undo(&mut self) -> DocumentResult<()> {
        let step = self.undo_stack.pop().ok_or(DocumentError::NothingToUndo)?;
        let current = self.capture();
        self.redo_stack.push(current);
        self.restore(step);
        Ok(())
    }

    /// Re-apply the last undone step
    pub fn redo(&mut self) -> DocumentResult<()> {
        let step = self.redo_stack.pop().ok_or(DocumentError::NothingToRedo)?;
        let current = self.capture();
        self.push_undo(current);
        self.restore(step);
        Ok(())
    }

    /// Number of undo steps available
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    fn push_undo(&mut self, step: UndoStep) {
        self.undo_stack.push(step);
        if self.undo_stack.len() > self.max_undo_steps {
            let excess = self.undo_stack.len() - self.max_undo_steps;
            self.undo_stack.drain(..excess);
        }
    }

    fn capture(&self) -> UndoStep {
        UndoStep {
            nodes: self.nodes.iter().map(|(h, n)| (h, n.clone())).collect(),
        }
    }

    fn restore(&mut self, step: UndoStep) {
        self.nodes.clear();
        self.names.clear();

        let mut remap = HashMap::new();
        let mut restored = Vec::with_capacity(step.nodes.len());
        for (old, node) in step.nodes {
            let key = (node.kind, node.name.clone());
            let handle = self.nodes.insert(node);
            self.names.insert(key, handle);
            remap.insert(old, handle);
            restored.push(handle);
        }

        for handle in restored {
            if let Some(node) = self.nodes.get_mut(handle) {
                for value in node.attributes.values_mut() {
                    *value = value.map_node_refs(&mut |h| remap.get(&h).map(|n| Value::Node(*n)));
                }
            }
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// `Cube.001` -> `Cube`; names without a numeric suffix are unchanged
fn strip_numeric_suffix(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, suffix))
            if !base.is_empty() && suffix.len() >= 3 && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => name,
    }
}
