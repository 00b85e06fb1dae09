//! Items are the unit of data flowing along connections.
//!
//! An [`Item`] carries a JSON object payload, optional named binary
//! attachments and provenance linking it back to the input item(s) it was
//! derived from. Items are never mutated in place once emitted by a node:
//! transformations build new items via [`Item::derive`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Binary attachment carried by an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryData {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub data: Vec<u8>,
}

impl BinaryData {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            file_name: None,
            data,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

/// Provenance link: index of the producing item within input port `input`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedItem {
    pub item: usize,
    #[serde(default)]
    pub input: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub json: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary: BTreeMap<String, BinaryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paired_item: Vec<PairedItem>,
    /// Set on items synthesized for a node that failed with continue-on-fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Item {
    pub fn new(json: Map<String, Value>) -> Self {
        Self {
            json,
            ..Self::default()
        }
    }

    /// Build an item from any JSON value. Non-object values are wrapped
    /// under a `value` key.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self::new(map)
            }
        }
    }

    /// Error-flagged item emitted in place of a failed node's output
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let mut map = Map::new();
        map.insert("error".to_string(), Value::String(message.clone()));
        Self {
            json: map,
            error: Some(message),
            ..Self::default()
        }
    }

    /// New item derived from this one (input index `index` on port 0).
    /// Binary attachments are carried over.
    pub fn derive(&self, index: usize, json: Map<String, Value>) -> Self {
        Self {
            json,
            binary: self.binary.clone(),
            paired_item: vec![PairedItem {
                item: index,
                input: 0,
            }],
            error: None,
        }
    }

    pub fn with_binary(mut self, name: impl Into<String>, data: BinaryData) -> Self {
        self.binary.insert(name.into(), data);
        self
    }

    pub fn paired_with(mut self, item: usize, input: usize) -> Self {
        self.paired_item.push(PairedItem { item, input });
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.json.get(key)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item::from_json(value)
    }
}

/// Ordered sequence of items flowing through one port at one point in a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemSet(Vec<Item>);

impl ItemSet {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_json<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        values.into_iter().map(Item::from_json).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.0.get(index)
    }

    pub fn first(&self) -> Option<&Item> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.0.iter()
    }

    pub fn push(&mut self, item: Item) {
        self.0.push(item);
    }

    /// Append `other` after the items already present
    pub fn extend(&mut self, other: ItemSet) {
        self.0.extend(other.0);
    }

    pub fn items(&self) -> &[Item] {
        &self.0
    }

    pub fn into_items(self) -> Vec<Item> {
        self.0
    }

    /// JSON payloads of all items, in order
    pub fn json_values(&self) -> Vec<Value> {
        self.0
            .iter()
            .map(|item| Value::Object(item.json.clone()))
            .collect()
    }
}

impl From<Vec<Item>> for ItemSet {
    fn from(items: Vec<Item>) -> Self {
        Self(items)
    }
}

impl FromIterator<Item> for ItemSet {
    fn from_iter<T: IntoIterator<Item = Item>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ItemSet {
    type Item = Item;
    type IntoIter = std::vec::IntoIter<Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ItemSet {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
