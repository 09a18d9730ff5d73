//! Tagged value tree
//!
//! Every node of a response tree, a stored record, or a query snapshot is a
//! [`Value`]. A value is statically either a scalar, an array, a plain object,
//! or a [`Reference`] to a record in the entity table. Entity-shaped objects
//! (objects carrying both `id` and `typename`) only exist in incoming trees and
//! denormalized snapshots; stored records hold references instead.

use super::{EntityId, Reference};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

/// Field name holding an entity's ID
pub const ID_FIELD: &str = "id";

/// Field name holding an entity's typename
pub const TYPENAME_FIELD: &str = "typename";

/// Field name marking an entity-shaped object as a tombstone
pub const TOMBSTONE_FIELD: &str = "__tombstone";

/// Object fields, ordered by key for deterministic output
pub type Fields = BTreeMap<String, Value>;

/// Removal marker carried by an entity-shaped object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tombstone {
    /// Drop the entity from the relation holding it
    Unlink,
    /// Drop the entity from the relation and delete the record
    Delete,
}

impl Tombstone {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "unlink" => Some(Self::Unlink),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Marker string stored under [`TOMBSTONE_FIELD`]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlink => "unlink",
            Self::Delete => "delete",
        }
    }
}

/// Identity carried by an object's fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Neither `id` nor `typename`
    Plain,
    /// Both `id` and `typename`
    Entity(Reference),
    /// Only one of the two; names the field that is present
    Partial(&'static str),
}

/// A node in a response tree, record, or snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Fields),
    Ref(Reference),
}

impl Value {
    /// Build an object from key/value pairs
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an entity-shaped object
    pub fn entity<K, I>(id: impl Into<String>, typename: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut map: Fields = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        map.insert(ID_FIELD.to_string(), Value::String(id.into()));
        map.insert(TYPENAME_FIELD.to_string(), Value::String(typename.into()));
        Value::Object(map)
    }

    /// Build a tombstoned entity-shaped object
    pub fn tombstone(id: impl Into<String>, typename: impl Into<String>, kind: Tombstone) -> Self {
        Value::entity(
            id,
            typename,
            [(TOMBSTONE_FIELD, Value::String(kind.as_str().to_string()))],
        )
    }

    /// Build a reference value
    pub fn reference(id: impl Into<EntityId>, typename: impl Into<String>) -> Self {
        Value::Ref(Reference::new(id, typename))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Fields> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&Reference> {
        match self {
            Value::Ref(reference) => Some(reference),
            _ => None,
        }
    }

    /// Look up a field of an object value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Identity of an object value; scalars, arrays and refs are [`Identity::Plain`]
    pub fn identity(&self) -> Identity {
        match self {
            Value::Object(fields) => identity_of(fields),
            _ => Identity::Plain,
        }
    }

    /// The entity this node stands for: either a reference or an entity-shaped object
    pub fn entity_ref(&self) -> Option<Reference> {
        match self {
            Value::Ref(reference) => Some(reference.clone()),
            Value::Object(fields) => match identity_of(fields) {
                Identity::Entity(reference) => Some(reference),
                _ => None,
            },
            _ => None,
        }
    }

    /// Tombstone marker of an entity-shaped object, if any
    pub fn tombstone_kind(&self) -> Option<Tombstone> {
        self.get(TOMBSTONE_FIELD)
            .and_then(Value::as_str)
            .and_then(Tombstone::parse)
    }

    /// True when every element is a reference or entity-shaped object
    pub fn is_entity_array(items: &[Value]) -> bool {
        !items.is_empty() && items.iter().all(|item| item.entity_ref().is_some())
    }

    /// Equality used for change detection
    ///
    /// Structural, except that entities compare by id only and arrays of
    /// entities compare by id multiset, ignoring order.
    pub fn diff_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.entity_ref(), other.entity_ref()) {
            return a.id == b.id;
        }
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                if Value::is_entity_array(a) && Value::is_entity_array(b) {
                    return id_multiset(a) == id_multiset(b);
                }
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.diff_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.diff_eq(other)))
            }
            _ => self == other,
        }
    }

    /// Visit every reference in this value, depth first
    pub fn for_each_ref<'a>(&'a self, f: &mut impl FnMut(&'a Reference)) {
        match self {
            Value::Ref(reference) => f(reference),
            Value::Array(items) => items.iter().for_each(|item| item.for_each_ref(f)),
            Value::Object(fields) => fields.values().for_each(|v| v.for_each_ref(f)),
            _ => {}
        }
    }
}

/// Classify an object's fields by the id/typename contract
pub fn identity_of(fields: &Fields) -> Identity {
    let id = fields.get(ID_FIELD).and_then(Value::as_str);
    let typename = fields.get(TYPENAME_FIELD).and_then(Value::as_str);
    match (id, typename) {
        (Some(id), Some(typename)) => Identity::Entity(Reference::new(id, typename)),
        (None, None) => Identity::Plain,
        (Some(_), None) => Identity::Partial(ID_FIELD),
        (None, Some(_)) => Identity::Partial(TYPENAME_FIELD),
    }
}

fn id_multiset(items: &[Value]) -> HashMap<EntityId, usize> {
    let mut counts = HashMap::new();
    for item in items {
        if let Some(reference) = item.entity_ref() {
            *counts.entry(reference.id).or_insert(0) += 1;
        }
    }
    counts
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
            Value::Ref(reference) => serde_json::json!({
                ID_FIELD: reference.id.as_str(),
                TYPENAME_FIELD: reference.typename,
            }),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Value::Ref(reference)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}
