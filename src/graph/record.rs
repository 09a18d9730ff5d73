//! Canonical record stored in the entity table

use super::value::{Fields, ID_FIELD, TYPENAME_FIELD};
use super::{EntityId, Reference, Value};
use serde::{Deserialize, Serialize};

/// One canonical entity
///
/// `fields` never contains `id` or `typename`; nested entities are stored as
/// [`Value::Ref`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier
    pub id: EntityId,

    /// Entity typename (e.g., "Person")
    pub typename: String,

    /// All other fields
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// Create an empty record
    pub fn new(id: impl Into<EntityId>, typename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            typename: typename.into(),
            fields: Fields::new(),
        }
    }

    /// Add a field (builder style)
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Reference pointing at this record
    pub fn reference(&self) -> Reference {
        Reference::new(self.id.clone(), self.typename.clone())
    }

    /// The record as an entity-shaped object, nested references left unresolved
    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        fields.insert(
            TYPENAME_FIELD.to_string(),
            Value::String(self.typename.clone()),
        );
        Value::Object(fields)
    }

    /// IDs of every record directly nested inside this one
    pub fn nested_ids(&self) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for value in self.fields.values() {
            value.for_each_ref(&mut |reference| {
                if !ids.contains(&reference.id) {
                    ids.push(reference.id.clone());
                }
            });
        }
        ids
    }

    /// Check whether every given field name is present
    pub fn has_fields(&self, names: &[String]) -> bool {
        names.iter().all(|name| self.fields.contains_key(name))
    }
}
