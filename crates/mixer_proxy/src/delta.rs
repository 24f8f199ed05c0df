//! Structural deltas
//!
//! Deltas are computed in proxy space (references are uuids) and applied
//! both to proxies and, after reference translation, to live nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::{NodeKind, NodeUuid};
use crate::value::{Media, SoaBuffer, Value};

/// Change of one attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueDelta {
    /// New value replacing the old one
    Replace(Value),
    /// Field-wise change of a struct value
    Struct(StructDelta),
}

impl ValueDelta {
    /// Apply to a value
    pub fn apply_to(&self, target: &mut Value) {
        match self {
            ValueDelta::Replace(value) => *target = value.clone(),
            ValueDelta::Struct(delta) => {
                if !matches!(target, Value::Struct(_)) {
                    *target = Value::Struct(BTreeMap::new());
                }
                if let Value::Struct(fields) = target {
                    delta.apply_to(fields);
                }
            }
        }
    }
}

/// Field-wise change of a map of values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructDelta {
    /// Fields added or changed
    pub updated: BTreeMap<String, ValueDelta>,
    /// Fields removed
    pub removed: Vec<String>,
}

impl StructDelta {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }

    /// Apply to a map
    pub fn apply_to(&self, fields: &mut BTreeMap<String, Value>) {
        for key in &self.removed {
            fields.remove(key);
        }
        for (key, delta) in &self.updated {
            let slot = fields.entry(key.clone()).or_insert(Value::Null);
            delta.apply_to(slot);
        }
    }
}

/// Compute the change from `old` to `new`, `None` if equal.
///
/// Structs are diffed field by field; every other value, lists included,
/// is replaced as a whole.
pub fn diff_value(old: &Value, new: &Value) -> Option<ValueDelta> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Struct(old_fields), Value::Struct(new_fields)) => {
            let delta = diff_struct(old_fields, new_fields);
            (!delta.is_empty()).then_some(ValueDelta::Struct(delta))
        }
        _ => Some(ValueDelta::Replace(new.clone())),
    }
}

/// Compute the field-wise change from `old` to `new`
pub fn diff_struct(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> StructDelta {
    let mut delta = StructDelta::default();
    for (key, new_value) in new {
        let change = match old.get(key) {
            Some(old_value) => diff_value(old_value, new_value),
            None => Some(ValueDelta::Replace(new_value.clone())),
        };
        if let Some(change) = change {
            delta.updated.insert(key.clone(), change);
        }
    }
    delta.removed = old.keys().filter(|k| !new.contains_key(*k)).cloned().collect();
    delta
}

/// Change of one bulk buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BufferDelta {
    /// Buffer added or rewritten
    Replace(SoaBuffer),
    /// Buffer removed
    Remove,
}

/// Change of the media payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaDelta {
    /// Payload added or replaced
    Replace(Media),
    /// Payload removed
    Remove,
}

/// Compute buffer changes: presence plus whole-buffer replacement
pub fn diff_buffers(
    old: &BTreeMap<String, SoaBuffer>,
    new: &BTreeMap<String, SoaBuffer>,
) -> BTreeMap<String, BufferDelta> {
    let mut changes = BTreeMap::new();
    for (key, buffer) in new {
        if old.get(key) != Some(buffer) {
            changes.insert(key.clone(), BufferDelta::Replace(buffer.clone()));
        }
    }
    for key in old.keys().filter(|k| !new.contains_key(*k)) {
        changes.insert(key.clone(), BufferDelta::Remove);
    }
    changes
}

/// Compute the media change
pub fn diff_media(old: &Option<Media>, new: &Option<Media>) -> Option<MediaDelta> {
    match (old, new) {
        (a, b) if a == b => None,
        (_, Some(media)) => Some(MediaDelta::Replace(media.clone())),
        (Some(_), None) => Some(MediaDelta::Remove),
        (None, None) => None,
    }
}

/// Apply buffer changes to a buffer map
pub fn apply_buffers(buffers: &mut BTreeMap<String, SoaBuffer>, changes: &BTreeMap<String, BufferDelta>) {
    for (key, change) in changes {
        match change {
            BufferDelta::Replace(buffer) => {
                buffers.insert(key.clone(), buffer.clone());
            }
            BufferDelta::Remove => {
                buffers.remove(key);
            }
        }
    }
}

/// Apply a media change
pub fn apply_media(media: &mut Option<Media>, change: &MediaDelta) {
    *media = match change {
        MediaDelta::Replace(payload) => Some(payload.clone()),
        MediaDelta::Remove => None,
    };
}

/// Change of one datablock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatablockDelta {
    /// Target datablock
    pub uuid: NodeUuid,
    /// Kind of the target, used for ordering
    pub kind: NodeKind,
    /// Attribute changes
    pub attributes: StructDelta,
    /// Buffer changes
    pub buffers: BTreeMap<String, BufferDelta>,
    /// Media change
    pub media: Option<MediaDelta>,
}

impl DatablockDelta {
    /// Create an empty delta
    pub fn new(uuid: NodeUuid, kind: NodeKind) -> Self {
        Self {
            uuid,
            kind,
            attributes: StructDelta::default(),
            buffers: BTreeMap::new(),
            media: None,
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.buffers.is_empty() && self.media.is_none()
    }

    /// Whether the only changes are updates of the given attributes
    pub fn only_touches(&self, keys: &[&str]) -> bool {
        !self.is_empty()
            && self.buffers.is_empty()
            && self.media.is_none()
            && self.attributes.removed.is_empty()
            && self.attributes.updated.keys().all(|k| keys.contains(&k.as_str()))
    }

    /// Whether the only change is the media payload
    pub fn is_media_only(&self) -> bool {
        self.media.is_some() && self.attributes.is_empty() && self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_equal_values_no_delta() {
        let value = Value::Struct(fields(&[("a", Value::Int(1))]));
        assert!(diff_value(&value, &value).is_none());
    }

    #[test]
    fn test_nested_struct_delta() {
        let old = Value::Struct(fields(&[
            ("a", Value::Int(1)),
            ("b", Value::Struct(fields(&[("x", Value::Float(1.0)), ("y", Value::Float(2.0))]))),
            ("gone", Value::Bool(true)),
        ]));
        let new = Value::Struct(fields(&[
            ("a", Value::Int(1)),
            ("b", Value::Struct(fields(&[("x", Value::Float(1.0)), ("y", Value::Float(3.0))]))),
            ("added", Value::from("hi")),
        ]));

        let delta = diff_value(&old, &new).unwrap();
        let ValueDelta::Struct(ref outer) = delta else {
            panic!("expected struct delta");
        };
        assert_eq!(outer.removed, vec!["gone".to_string()]);
        assert!(outer.updated.contains_key("added"));
        assert!(!outer.updated.contains_key("a"));
        assert!(matches!(outer.updated["b"], ValueDelta::Struct(_)));

        let mut patched = old.clone();
        delta.apply_to(&mut patched);
        assert_eq!(patched, new);
    }

    #[test]
    fn test_list_is_replaced() {
        let old = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let new = Value::List(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(diff_value(&old, &new), Some(ValueDelta::Replace(new.clone())));
    }

    #[test]
    fn test_struct_delta_on_non_struct() {
        let mut target = Value::Int(5);
        let mut delta = StructDelta::default();
        delta.updated.insert("x".into(), ValueDelta::Replace(Value::Int(1)));
        ValueDelta::Struct(delta).apply_to(&mut target);
        assert_eq!(target, Value::Struct(fields(&[("x", Value::Int(1))])));
    }

    #[test]
    fn test_buffer_delta() {
        let a = SoaBuffer::from_f32(3, &[0.0; 3]);
        let b = SoaBuffer::from_f32(3, &[1.0; 3]);
        let mut old = BTreeMap::new();
        old.insert("co".to_string(), a.clone());
        old.insert("normals".to_string(), a.clone());
        let mut new = BTreeMap::new();
        new.insert("co".to_string(), b.clone());

        let changes = diff_buffers(&old, &new);
        assert_eq!(changes["co"], BufferDelta::Replace(b));
        assert_eq!(changes["normals"], BufferDelta::Remove);

        apply_buffers(&mut old, &changes);
        assert_eq!(old, new);
    }

    #[test]
    fn test_media_delta() {
        let media = Some(Media::new("a.png", vec![1, 2]));
        assert!(diff_media(&media, &media).is_none());
        assert_eq!(diff_media(&media, &None), Some(MediaDelta::Remove));
        assert!(matches!(diff_media(&None, &media), Some(MediaDelta::Replace(_))));
    }

    #[test]
    fn test_only_touches() {
        let mut delta = DatablockDelta::new(NodeUuid::from_u128(1), NodeKind::Object);
        assert!(!delta.only_touches(&["location"]));
        delta
            .attributes
            .updated
            .insert("location".into(), ValueDelta::Replace(Value::from([1.0, 2.0, 3.0])));
        assert!(delta.only_touches(&["location", "rotation"]));
        delta.attributes.removed.push("parent".into());
        assert!(!delta.only_touches(&["location"]));
    }
}
