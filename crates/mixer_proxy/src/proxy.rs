//! Datablock proxies
//!
//! A [`DatablockProxy`] is the last synchronized state of one datablock,
//! with references expressed as uuids. It is what creation commands carry
//! and what local diffs are computed against.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::delta::{self, DatablockDelta};
use crate::document::{Document, LiveNode};
use crate::error::CreationError;
use crate::handle::LiveHandle;
use crate::id::{NodeKind, NodeUuid};
use crate::value::{Media, SoaBuffer, Value};

/// Attribute holding the external file path of an image
pub const FILEPATH_KEY: &str = "filepath";

/// Outcome of creating a live node from a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// The new node
    pub handle: LiveHandle,
    /// Referenced datablocks not available yet, written as null
    pub unresolved: BTreeSet<NodeUuid>,
}

/// Synchronized state of one datablock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatablockProxy {
    /// Stable identity
    pub uuid: NodeUuid,
    /// Kind of datablock
    pub kind: NodeKind,
    /// Name as last synchronized
    pub name: String,
    /// Attributes with references as [`Value::Ref`]
    pub attributes: BTreeMap<String, Value>,
    /// Bulk buffers
    pub buffers: BTreeMap<String, SoaBuffer>,
    /// Embedded media payload
    pub media: Option<Media>,
    /// Whether a live node backs this proxy
    #[serde(skip)]
    pub has_live_node: bool,
}

impl DatablockProxy {
    /// Capture a live node. `resolve` maps referenced handles to uuids;
    /// references it cannot map become null.
    pub fn from_live(
        uuid: NodeUuid,
        node: &LiveNode,
        resolve: &impl Fn(LiveHandle) -> Option<NodeUuid>,
    ) -> Self {
        Self {
            uuid,
            kind: node.kind,
            name: node.name().to_string(),
            attributes: to_proxy_attributes(&node.attributes, resolve),
            buffers: node.buffers.clone(),
            media: node.media.clone(),
            has_live_node: true,
        }
    }

    /// Datablocks referenced by this proxy
    pub fn references(&self) -> BTreeSet<NodeUuid> {
        let mut out = Vec::new();
        for value in self.attributes.values() {
            value.uuid_refs(&mut out);
        }
        out.into_iter().collect()
    }

    /// Create the live node.
    ///
    /// Images need an embedded payload or an available external file;
    /// otherwise creation fails with [`CreationError::MissingExternalFile`].
    pub fn materialize(
        &self,
        doc: &mut Document,
        bindings: &HashMap<NodeUuid, LiveHandle>,
    ) -> Result<Materialized, CreationError> {
        if self.kind.requires_media() && self.media.is_none() {
            let path = self
                .attributes
                .get(FILEPATH_KEY)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !doc.has_external_file(path) {
                return Err(CreationError::MissingExternalFile(path.to_string()));
            }
        }

        let mut unresolved = BTreeSet::new();
        let mut node = LiveNode::new(self.kind, &self.name);
        node.attributes = to_live_attributes(&self.attributes, bindings, &mut unresolved);
        node.buffers = self.buffers.clone();
        node.media = self.media.clone();

        let handle = doc.insert_node(node);
        doc.set_uuid(handle, self.uuid)?;
        Ok(Materialized { handle, unresolved })
    }

    /// Compute the change from this proxy to the live node
    pub fn diff(
        &self,
        node: &LiveNode,
        resolve: &impl Fn(LiveHandle) -> Option<NodeUuid>,
    ) -> Option<DatablockDelta> {
        let live_attributes = to_proxy_attributes(&node.attributes, resolve);
        let mut change = DatablockDelta::new(self.uuid, self.kind);
        change.attributes = delta::diff_struct(&self.attributes, &live_attributes);
        change.buffers = delta::diff_buffers(&self.buffers, &node.buffers);
        change.media = delta::diff_media(&self.media, &node.media);
        (!change.is_empty()).then_some(change)
    }

    /// Apply a delta to the proxy
    pub fn apply(&mut self, change: &DatablockDelta) {
        change.attributes.apply_to(&mut self.attributes);
        delta::apply_buffers(&mut self.buffers, &change.buffers);
        if let Some(media) = &change.media {
            delta::apply_media(&mut self.media, media);
        }
    }

    /// Write the attributes touched by `change` to the live node,
    /// translating references. Call after [`DatablockProxy::apply`] so the
    /// proxy holds the post-delta values.
    ///
    /// Returns the referenced datablocks that could not be resolved.
    pub fn write_live(
        &self,
        change: &DatablockDelta,
        node: &mut LiveNode,
        bindings: &HashMap<NodeUuid, LiveHandle>,
    ) -> BTreeSet<NodeUuid> {
        let mut unresolved = BTreeSet::new();
        for key in &change.attributes.removed {
            node.attributes.remove(key);
        }
        for key in change.attributes.updated.keys() {
            match self.attributes.get(key) {
                Some(value) => {
                    node.attributes
                        .insert(key.clone(), to_live_value(value, bindings, &mut unresolved));
                }
                None => {
                    node.attributes.remove(key);
                }
            }
        }
        delta::apply_buffers(&mut node.buffers, &change.buffers);
        if let Some(media) = &change.media {
            delta::apply_media(&mut node.media, media);
        }
        unresolved
    }

    /// Rewrite the live attributes that reference `target`.
    ///
    /// Used once a previously unresolved datablock becomes available.
    pub fn write_references_to(
        &self,
        target: NodeUuid,
        node: &mut LiveNode,
        bindings: &HashMap<NodeUuid, LiveHandle>,
    ) -> BTreeSet<NodeUuid> {
        let mut unresolved = BTreeSet::new();
        for (key, value) in &self.attributes {
            if value.references_uuid(target) {
                node.attributes
                    .insert(key.clone(), to_live_value(value, bindings, &mut unresolved));
            }
        }
        unresolved
    }

    /// Drop every reference to `target` from the attributes, the way
    /// [`Document::unlink_references_to`] does on live nodes
    pub fn unlink_references_to(&mut self, target: NodeUuid) {
        for value in self.attributes.values_mut() {
            *value = value.map_uuid_refs(&mut |uuid| (uuid != target).then_some(Value::Ref(uuid)));
        }
    }
}

fn to_proxy_attributes(
    attributes: &BTreeMap<String, Value>,
    resolve: &impl Fn(LiveHandle) -> Option<NodeUuid>,
) -> BTreeMap<String, Value> {
    attributes
        .iter()
        .map(|(key, value)| {
            let converted = value.map_node_refs(&mut |handle| resolve(handle).map(Value::Ref));
            (key.clone(), converted)
        })
        .collect()
}

fn to_live_value(
    value: &Value,
    bindings: &HashMap<NodeUuid, LiveHandle>,
    unresolved: &mut BTreeSet<NodeUuid>,
) -> Value {
    value.map_uuid_refs(&mut |uuid| match bindings.get(&uuid) {
        Some(handle) => Some(Value::Node(*handle)),
        None => {
            unresolved.insert(uuid);
            None
        }
    })
}

fn to_live_attributes(
    attributes: &BTreeMap<String, Value>,
    bindings: &HashMap<NodeUuid, LiveHandle>,
    unresolved: &mut BTreeSet<NodeUuid>,
) -> BTreeMap<String, Value> {
    attributes
        .iter()
        .map(|(key, value)| (key.clone(), to_live_value(value, bindings, unresolved)))
        .collect()
}
