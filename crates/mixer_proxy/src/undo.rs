//! Undo/redo reconciliation
//!
//! An undo rebuilds the live document, so every node comes back under a new
//! handle. Without reconciliation the next diff would see each proxy lose
//! its live node and an unknown node appear.
//!
//! ```ignore
//! let snapshot = UndoSnapshot::capture(&doc);
//! doc.undo()?;
//! let report = state.reconcile_undo(&snapshot, &mut doc);
//! let changeset = state.diff(&mut doc);
//! ```

use std::collections::HashMap;

use crate::document::Document;
use crate::handle::LiveHandle;
use crate::id::{NodeKind, NodeUuid};
use crate::state::ProxyState;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SnapshotEntry {
    kind: NodeKind,
    name: String,
    handle: LiveHandle,
}

/// Uuid to live identity mapping taken before an undo or redo
#[derive(Debug, Clone, Default)]
pub struct UndoSnapshot {
    entries: HashMap<NodeUuid, SnapshotEntry>,
}

impl UndoSnapshot {
    /// Record every tagged node of the document
    pub fn capture(doc: &Document) -> Self {
        let entries = doc
            .iter()
            .filter_map(|(handle, node)| {
                node.uuid().map(|uuid| {
                    (
                        uuid,
                        SnapshotEntry {
                            kind: node.kind,
                            name: node.name().to_string(),
                            handle,
                        },
                    )
                })
            })
            .collect();
        Self { entries }
    }

    /// Number of recorded nodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `uuid` was recorded
    pub fn contains(&self, uuid: NodeUuid) -> bool {
        self.entries.contains_key(&uuid)
    }
}

/// What [`ProxyState::reconcile_undo`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoReport {
    /// Proxies bound to a new live node
    pub rebound: Vec<NodeUuid>,
    /// Untagged nodes recognized by kind and name and tagged again
    pub retagged: Vec<NodeUuid>,
    /// Proxies without a live node after the operation
    pub vanished: Vec<NodeUuid>,
    /// Nodes whose name changed: uuid, name before, name after
    pub renamed: Vec<(NodeUuid, String, String)>,
}

impl UndoReport {
    /// Whether the operation left every binding intact
    pub fn is_empty(&self) -> bool {
        self.rebound.is_empty()
            && self.retagged.is_empty()
            && self.vanished.is_empty()
            && self.renamed.is_empty()
    }
}

impl ProxyState {
    /// Remap proxies onto the live nodes restored by an undo or redo.
    ///
    /// Must run before the next [`ProxyState::diff`].
    pub fn reconcile_undo(&mut self, before: &UndoSnapshot, doc: &mut Document) -> UndoReport {
        let mut report = UndoReport::default();
        let mut index = doc.uuid_index();

        let untagged: Vec<(LiveHandle, NodeKind, String)> = doc
            .iter()
            .filter(|(_, node)| node.uuid().is_none())
            .map(|(handle, node)| (handle, node.kind, node.name().to_string()))
            .collect();
        for (handle, kind, name) in untagged {
            let lost = before
                .entries
                .iter()
                .find(|(uuid, entry)| entry.kind == kind && entry.name == name && !index.contains_key(*uuid))
                .map(|(uuid, _)| *uuid);
            if let Some(uuid) = lost {
                if doc.set_uuid(handle, uuid).is_ok() {
                    index.insert(uuid, handle);
                    report.retagged.push(uuid);
                }
            }
        }

        for (uuid, proxy) in &self.proxies {
            if !proxy.has_live_node {
                continue;
            }
            match index.get(uuid) {
                Some(handle) => {
                    if self.handles.get(uuid) != Some(handle) {
                        report.rebound.push(*uuid);
                    }
                    if let (Some(entry), Some(node)) = (before.entries.get(uuid), doc.get(*handle)) {
                        if entry.name != node.name() {
                            report.renamed.push((*uuid, entry.name.clone(), node.name().to_string()));
                        }
                    }
                }
                None => report.vanished.push(*uuid),
            }
        }

        for uuid in &report.rebound {
            if let Some(handle) = index.get(uuid) {
                self.handles.insert(*uuid, *handle);
            }
        }

        report.rebound.sort();
        report.retagged.sort();
        report.vanished.sort();
        report.renamed.sort();
        log::debug!(
            "Undo reconciled: {} rebound, {} retagged, {} vanished, {} renamed",
            report.rebound.len(),
            report.retagged.len(),
            report.vanished.len(),
            report.renamed.len()
        );
        report
    }
}
