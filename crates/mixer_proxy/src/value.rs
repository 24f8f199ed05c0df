//! Attribute values and bulk buffers
//!
//! Live nodes and proxies share the same [`Value`] type. The only difference
//! is how cross-node references are expressed: live nodes hold
//! [`Value::Node`] handles, proxies hold [`Value::Ref`] uuids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::handle::LiveHandle;
use crate::id::NodeUuid;

/// Buffers larger than this many bytes are lz4 compressed when serialized
pub const COMPRESSION_THRESHOLD: usize = 4096;

/// A dynamic attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null/None value, also used for unresolved references
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Fixed-size numeric vector (location, color, quaternion, ...)
    Vector(Vec<f64>),
    /// Nested structure, diffed field by field
    Struct(BTreeMap<String, Value>),
    /// Collection-valued aggregate, always replaced as a whole
    List(Vec<Value>),
    /// Reference to another live node (live document only)
    Node(LiveHandle),
    /// Reference to another datablock (proxies only)
    Ref(NodeUuid),
}

impl Value {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as vector
    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as struct
    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Live handles referenced by this value, recursively
    pub fn node_refs(&self, out: &mut Vec<LiveHandle>) {
        match self {
            Self::Node(handle) => out.push(*handle),
            Self::Struct(fields) => fields.values().for_each(|v| v.node_refs(out)),
            Self::List(items) => items.iter().for_each(|v| v.node_refs(out)),
            _ => {}
        }
    }

    /// Datablock uuids referenced by this value, recursively
    pub fn uuid_refs(&self, out: &mut Vec<NodeUuid>) {
        match self {
            Self::Ref(uuid) => out.push(*uuid),
            Self::Struct(fields) => fields.values().for_each(|v| v.uuid_refs(out)),
            Self::List(items) => items.iter().for_each(|v| v.uuid_refs(out)),
            _ => {}
        }
    }

    /// Rewrite every node reference. A `None` result removes list items and
    /// nulls any other position.
    pub fn map_node_refs(&self, f: &mut impl FnMut(LiveHandle) -> Option<Value>) -> Value {
        match self {
            Self::Node(handle) => f(*handle).unwrap_or(Value::Null),
            Self::Struct(fields) => Self::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_node_refs(f)))
                    .collect(),
            ),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Self::Node(handle) => f(*handle),
                        other => Some(other.map_node_refs(f)),
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Rewrite every uuid reference, with the same list and null rules as
    /// [`Value::map_node_refs`]
    pub fn map_uuid_refs(&self, f: &mut impl FnMut(NodeUuid) -> Option<Value>) -> Value {
        match self {
            Self::Ref(uuid) => f(*uuid).unwrap_or(Value::Null),
            Self::Struct(fields) => Self::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_uuid_refs(f)))
                    .collect(),
            ),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Self::Ref(uuid) => f(*uuid),
                        other => Some(other.map_uuid_refs(f)),
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Whether this value references `target`
    pub fn references_uuid(&self, target: NodeUuid) -> bool {
        let mut out = Vec::new();
        self.uuid_refs(&mut out);
        out.contains(&target)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<[f64; 3]> for Value {
    fn from(v: [f64; 3]) -> Self {
        Self::Vector(v.to_vec())
    }
}

impl From<[f64; 4]> for Value {
    fn from(v: [f64; 4]) -> Self {
        Self::Vector(v.to_vec())
    }
}

impl From<LiveHandle> for Value {
    fn from(v: LiveHandle) -> Self {
        Self::Node(v)
    }
}

impl From<NodeUuid> for Value {
    fn from(v: NodeUuid) -> Self {
        Self::Ref(v)
    }
}

/// Element type of a [`SoaBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoaElement {
    F32,
    I32,
    U8,
}

impl SoaElement {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            SoaElement::F32 | SoaElement::I32 => 4,
            SoaElement::U8 => 1,
        }
    }
}

/// Struct-of-arrays buffer for large homogeneous data (positions, indices).
///
/// Buffers are never diffed element-wise: any change replaces the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "PackedBuffer", try_from = "PackedBuffer")]
pub struct SoaBuffer {
    element: SoaElement,
    components: u32,
    data: Vec<u8>,
}

impl SoaBuffer {
    /// Build from f32 values, `components` per item (3 for positions)
    pub fn from_f32(components: u32, values: &[f32]) -> Self {
        Self {
            element: SoaElement::F32,
            components,
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Build from i32 values
    pub fn from_i32(components: u32, values: &[i32]) -> Self {
        Self {
            element: SoaElement::I32,
            components,
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Build from bytes
    pub fn from_u8(components: u32, values: &[u8]) -> Self {
        Self {
            element: SoaElement::U8,
            components,
            data: values.to_vec(),
        }
    }

    /// Element type
    pub fn element(&self) -> SoaElement {
        self.element
    }

    /// Components per item
    pub fn components(&self) -> u32 {
        self.components
    }

    /// Raw bytes
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of items
    pub fn item_count(&self) -> usize {
        let stride = self.element.size() * self.components.max(1) as usize;
        self.data.len() / stride
    }

    /// Values as f32, if this is an f32 buffer
    pub fn as_f32(&self) -> Option<Vec<f32>> {
        (self.element == SoaElement::F32).then(|| collect_pod(&self.data))
    }

    /// Values as i32, if this is an i32 buffer
    pub fn as_i32(&self) -> Option<Vec<i32>> {
        (self.element == SoaElement::I32).then(|| collect_pod(&self.data))
    }
}

/// Copy raw bytes into a typed vector; trailing partial elements are ignored
fn collect_pod<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    let count = bytes.len() / std::mem::size_of::<T>();
    let mut values = vec![T::zeroed(); count];
    bytemuck::cast_slice_mut::<T, u8>(&mut values)
        .copy_from_slice(&bytes[..count * std::mem::size_of::<T>()]);
    values
}

/// Serialized form of a [`SoaBuffer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedBuffer {
    element: SoaElement,
    components: u32,
    compressed: bool,
    bytes: Vec<u8>,
}

impl From<SoaBuffer> for PackedBuffer {
    fn from(buffer: SoaBuffer) -> Self {
        if buffer.data.len() > COMPRESSION_THRESHOLD {
            Self {
                element: buffer.element,
                components: buffer.components,
                compressed: true,
                bytes: lz4_flex::compress_prepend_size(&buffer.data),
            }
        } else {
            Self {
                element: buffer.element,
                components: buffer.components,
                compressed: false,
                bytes: buffer.data,
            }
        }
    }
}

impl TryFrom<PackedBuffer> for SoaBuffer {
    type Error = String;

    fn try_from(packed: PackedBuffer) -> Result<Self, Self::Error> {
        let data = if packed.compressed {
            lz4_flex::decompress_size_prepended(&packed.bytes)
                .map_err(|e| format!("lz4 decompression failed: {}", e))?
        } else {
            packed.bytes
        };
        if data.len() % packed.element.size() != 0 {
            return Err(format!(
                "{} bytes is not a multiple of the {:?} element size",
                data.len(),
                packed.element
            ));
        }
        Ok(Self {
            element: packed.element,
            components: packed.components,
            data,
        })
    }
}

/// Embedded media payload (image pixels or file contents)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Original file name
    pub file_name: String,
    /// Raw bytes
    pub bytes: Vec<u8>,
}

impl Media {
    /// Create a media payload
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }
}
