//! Deferred remote operations
//!
//! Remote changes received while the local editor is in an unsafe
//! interaction mode are queued here and replayed in arrival order once the
//! editor is back in a safe mode.

use std::collections::VecDeque;

use crate::changeset::{Changeset, Rename};
use crate::delta::DatablockDelta;
use crate::id::NodeUuid;
use crate::proxy::DatablockProxy;

/// A received datablock operation
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOp {
    /// Create a datablock
    Create(DatablockProxy),
    /// Update a datablock
    Update(DatablockDelta),
    /// Remove a datablock
    Remove(NodeUuid),
    /// Rename a batch of datablocks
    Rename(Vec<Rename>),
}

impl RemoteOp {
    /// Short name for logging
    pub fn label(&self) -> &'static str {
        match self {
            RemoteOp::Create(_) => "create",
            RemoteOp::Update(_) => "update",
            RemoteOp::Remove(_) => "remove",
            RemoteOp::Rename(_) => "rename",
        }
    }

    /// Split a changeset into operations, in application order
    pub fn from_changeset(mut changeset: Changeset) -> Vec<RemoteOp> {
        changeset.sort();
        let mut ops = Vec::with_capacity(changeset.len());
        ops.extend(changeset.removals.into_iter().map(|r| RemoteOp::Remove(r.uuid)));
        if !changeset.renames.is_empty() {
            ops.push(RemoteOp::Rename(changeset.renames));
        }
        ops.extend(changeset.creations.into_iter().map(RemoteOp::Create));
        ops.extend(changeset.updates.into_iter().map(RemoteOp::Update));
        ops
    }
}

/// FIFO of operations waiting for a safe interaction mode
#[derive(Debug, Default)]
pub struct DeferredQueue {
    ops: VecDeque<RemoteOp>,
}

impl DeferredQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation
    pub fn push(&mut self, op: RemoteOp) {
        log::debug!("Deferring remote {}", op.label());
        self.ops.push_back(op);
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Take every queued operation, oldest first
    pub fn drain(&mut self) -> Vec<RemoteOp> {
        std::mem::take(&mut self.ops).into()
    }

    /// Drop every queued operation
    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Removal;
    use crate::id::NodeKind;

    #[test]
    fn test_fifo_drain() {
        let mut queue = DeferredQueue::new();
        let a = NodeUuid::from_u128(1);
        let b = NodeUuid::from_u128(2);
        queue.push(RemoteOp::Remove(a));
        queue.push(RemoteOp::Rename(Vec::new()));
        queue.push(RemoteOp::Remove(b));
        assert_eq!(queue.len(), 3);

        let drained = queue.drain();
        assert_eq!(drained[0], RemoteOp::Remove(a));
        assert_eq!(drained[1].label(), "rename");
        assert_eq!(drained[2], RemoteOp::Remove(b));
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_from_changeset_order() {
        let mut changeset = Changeset::new();
        changeset.updates.push(DatablockDelta::new(NodeUuid::from_u128(3), NodeKind::Object));
        changeset.removals.push(Removal {
            uuid: NodeUuid::from_u128(4),
            kind: NodeKind::Mesh,
            name: "Mesh".into(),
        });
        changeset.removals.push(Removal {
            uuid: NodeUuid::from_u128(5),
            kind: NodeKind::Object,
            name: "Cube".into(),
        });
        changeset.renames.push(Rename {
            uuid: NodeUuid::from_u128(3),
            kind: NodeKind::Object,
            old_name: "A".into(),
            new_name: "B".into(),
        });

        let labels: Vec<&str> = RemoteOp::from_changeset(changeset.clone()).iter().map(|op| op.label()).collect();
        assert_eq!(labels, vec!["remove", "remove", "rename", "update"]);

        let ops = RemoteOp::from_changeset(changeset);
        assert_eq!(ops[0], RemoteOp::Remove(NodeUuid::from_u128(5)));
    }
}
