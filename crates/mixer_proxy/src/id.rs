//! Datablock identity and kinds

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, stable identity of a datablock.
///
/// Assigned once when a node is first observed or created, and never reused
/// for another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUuid(Uuid);

impl NodeUuid {
    /// Create a new random uuid
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a raw value
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Get the underlying uuid
    pub fn raw(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of datablock
///
/// Kinds are ordered by creation priority: a node may only reference nodes
/// of a lower or equal priority, so creating in priority order never needs
/// a forward reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    /// Pixel data, loaded from an embedded payload or an external file
    Image,
    /// Shading parameters, may reference images
    Material,
    /// Geometry with bulk vertex buffers
    Mesh,
    /// Light source data
    Light,
    /// Camera data
    Camera,
    /// Instance placing object data in the scene
    Object,
    /// Group of objects
    Collection,
    /// Top-level container
    Scene,
}

impl NodeKind {
    /// All kinds, in priority order
    pub const ALL: [NodeKind; 8] = [
        NodeKind::Image,
        NodeKind::Material,
        NodeKind::Mesh,
        NodeKind::Light,
        NodeKind::Camera,
        NodeKind::Object,
        NodeKind::Collection,
        NodeKind::Scene,
    ];

    /// Creation priority, lower first
    pub fn priority(&self) -> u8 {
        match self {
            NodeKind::Image => 0,
            NodeKind::Material => 1,
            NodeKind::Mesh | NodeKind::Light | NodeKind::Camera => 2,
            NodeKind::Object => 3,
            NodeKind::Collection => 4,
            NodeKind::Scene => 5,
        }
    }

    /// Lowercase label
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Image => "image",
            NodeKind::Material => "material",
            NodeKind::Mesh => "mesh",
            NodeKind::Light => "light",
            NodeKind::Camera => "camera",
            NodeKind::Object => "object",
            NodeKind::Collection => "collection",
            NodeKind::Scene => "scene",
        }
    }

    /// Whether live creation needs pixel data or an external file
    pub fn requires_media(&self) -> bool {
        matches!(self, NodeKind::Image)
    }

    /// Whether nodes of this kind carry a transform
    pub fn has_transform(&self) -> bool {
        matches!(self, NodeKind::Object)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_parse_display() {
        let uuid = NodeUuid::from_u128(1);
        let text = uuid.to_string();
        assert_eq!(text.parse::<NodeUuid>().unwrap(), uuid);
        assert!("not-a-uuid".parse::<NodeUuid>().is_err());
    }

    #[test]
    fn test_uuids_unique() {
        assert_ne!(NodeUuid::new(), NodeUuid::new());
    }

    #[test]
    fn test_priority_order() {
        assert!(NodeKind::Image.priority() < NodeKind::Material.priority());
        assert!(NodeKind::Material.priority() < NodeKind::Mesh.priority());
        assert_eq!(NodeKind::Mesh.priority(), NodeKind::Camera.priority());
        assert!(NodeKind::Camera.priority() < NodeKind::Object.priority());
        assert!(NodeKind::Object.priority() < NodeKind::Collection.priority());
        assert!(NodeKind::Collection.priority() < NodeKind::Scene.priority());

        let mut sorted = NodeKind::ALL;
        sorted.sort_by_key(|k| k.priority());
        assert_eq!(sorted, NodeKind::ALL);
    }
}
