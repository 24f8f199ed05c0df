//! Changesets
//!
//! A [`Changeset`] is everything that changed between the proxies and the
//! live document, split by operation and sorted so that it can be applied
//! without forward or dangling references:
//!
//! - creations by ascending kind priority (referents first)
//! - removals by descending kind priority (referrers first), most recent
//!   creation first
//! - updates by ascending kind priority
//!
//! Within a kind, the original order is kept.

use serde::{Deserialize, Serialize};

use crate::delta::DatablockDelta;
use crate::id::{NodeKind, NodeUuid};
use crate::proxy::DatablockProxy;

/// Removal of a datablock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    /// Removed datablock
    pub uuid: NodeUuid,
    /// Its kind, used for ordering
    pub kind: NodeKind,
    /// Its last synchronized name, for logging
    pub name: String,
}

/// Rename of a datablock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    /// Renamed datablock
    pub uuid: NodeUuid,
    /// Its kind
    pub kind: NodeKind,
    /// Name before the rename
    pub old_name: String,
    /// Name after the rename
    pub new_name: String,
}

/// Ordered set of datablock changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// New datablocks
    pub creations: Vec<DatablockProxy>,
    /// Deleted datablocks
    pub removals: Vec<Removal>,
    /// Renamed datablocks
    pub renames: Vec<Rename>,
    /// Changed datablocks
    pub updates: Vec<DatablockDelta>,
}

impl Changeset {
    /// Create an empty changeset
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty()
            && self.removals.is_empty()
            && self.renames.is_empty()
            && self.updates.is_empty()
    }

    /// Total number of operations
    pub fn len(&self) -> usize {
        self.creations.len() + self.removals.len() + self.renames.len() + self.updates.len()
    }

    /// Sort every list into its application order (stable)
    pub fn sort(&mut self) {
        self.creations.sort_by_key(|c| c.kind.priority());
        self.removals.sort_by_key(|r| std::cmp::Reverse(r.kind.priority()));
        self.updates.sort_by_key(|u| u.kind.priority());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn proxy(kind: NodeKind, n: u128) -> DatablockProxy {
        DatablockProxy {
            uuid: NodeUuid::from_u128(n),
            kind,
            name: format!("{}{}", kind, n),
            attributes: BTreeMap::new(),
            buffers: BTreeMap::new(),
            media: None,
            has_live_node: true,
        }
    }

    fn removal(kind: NodeKind, n: u128) -> Removal {
        Removal {
            uuid: NodeUuid::from_u128(n),
            kind,
            name: String::new(),
        }
    }

    #[test]
    fn test_creation_order() {
        let mut changeset = Changeset::new();
        changeset.creations = vec![
            proxy(NodeKind::Scene, 1),
            proxy(NodeKind::Object, 2),
            proxy(NodeKind::Mesh, 3),
            proxy(NodeKind::Object, 4),
            proxy(NodeKind::Material, 5),
        ];
        changeset.sort();
        let order: Vec<u128> = changeset.creations.iter().map(|c| c.uuid.raw().as_u128()).collect();
        assert_eq!(order, vec![5, 3, 2, 4, 1]);
    }

    #[test]
    fn test_removal_order_reversed() {
        let mut changeset = Changeset::new();
        changeset.removals = vec![
            removal(NodeKind::Mesh, 1),
            removal(NodeKind::Collection, 2),
            removal(NodeKind::Object, 3),
        ];
        changeset.sort();
        let kinds: Vec<NodeKind> = changeset.removals.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![NodeKind::Collection, NodeKind::Object, NodeKind::Mesh]);
    }

    #[test]
    fn test_len() {
        let mut changeset = Changeset::new();
        assert!(changeset.is_empty());
        changeset.removals.push(removal(NodeKind::Mesh, 1));
        changeset.creations.push(proxy(NodeKind::Mesh, 2));
        assert_eq!(changeset.len(), 2);
    }
}
