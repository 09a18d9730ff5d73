//! Re-deriving snapshots from the entity table
//!
//! A snapshot keeps the shape of the tree it was first built from: an entity
//! node only carries the fields the original payload selected. Refreshing walks
//! the old snapshot as a template and pulls current values from the table.
//! Query snapshots use [`ArrayOrder::Snapshot`] so that patching and
//! refreshing agree; the response of a `store()` call uses stored order.

use crate::graph::value::{identity_of, ID_FIELD, TYPENAME_FIELD};
use crate::graph::{EntityId, Fields, Identity, Record, Reference, Value};
use crate::store::EntityTable;
use std::collections::HashSet;

/// Shape of an ingested tree with tombstoned entities removed
///
/// Tombstones in object slots become `Null`; tombstones in arrays are dropped.
pub(crate) fn strip_tombstones(value: &Value) -> Value {
    match value {
        _ if is_tombstone(value) => Value::Null,
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, child)| (key.clone(), strip_tombstones(child)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| !is_tombstone(item))
                .map(strip_tombstones)
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_tombstone(value: &Value) -> bool {
    value.tombstone_kind().is_some() && value.entity_ref().is_some()
}

/// How arrays of entities are ordered when re-derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOrder {
    /// Follow the stored array; used when building a fresh response
    Stored,
    /// Keep the elements the previous tree already had in their old positions,
    /// then append ids new to the stored array in stored order
    ///
    /// Reordering a stored array emits no update event, so a snapshot that
    /// is only ever patched keeps its old order. Refreshing must do the same.
    Snapshot,
}

/// Re-derives trees from the entity table
#[derive(Debug, Clone, Copy)]
pub struct Denormalizer<'t> {
    table: &'t EntityTable,
    order: ArrayOrder,
}

impl<'t> Denormalizer<'t> {
    pub fn new(table: &'t EntityTable, order: ArrayOrder) -> Self {
        Self { table, order }
    }

    pub fn table(&self) -> &'t EntityTable {
        self.table
    }

    /// Re-derive a whole tree
    ///
    /// Entity nodes whose record is gone become `Null` in object slots and are
    /// dropped from arrays. Arrays with no enclosing entity resolve each
    /// element against the table directly.
    pub fn refresh_tree(&self, snapshot: &Value) -> Value {
        match snapshot {
            Value::Object(fields) => match identity_of(fields) {
                Identity::Entity(reference) => self
                    .table
                    .get(reference.id.as_str())
                    .map(|record| self.derive_entity(record, snapshot))
                    .unwrap_or(Value::Null),
                _ => Value::Object(
                    fields
                        .iter()
                        .map(|(key, child)| (key.clone(), self.refresh_tree(child)))
                        .collect(),
                ),
            },
            Value::Ref(reference) if !self.table.contains(reference.id.as_str()) => Value::Null,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .filter(|item| {
                        item.entity_ref()
                            .is_none_or(|reference| self.table.contains(reference.id.as_str()))
                    })
                    .map(|item| self.refresh_tree(item))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Denormalize one record using `shape` to pick which fields to include
    pub fn derive_entity(&self, record: &Record, shape: &Value) -> Value {
        let mut fields = Fields::new();
        fields.insert(ID_FIELD.to_string(), Value::String(record.id.to_string()));
        fields.insert(
            TYPENAME_FIELD.to_string(),
            Value::String(record.typename.clone()),
        );

        if let Some(shape_fields) = shape.as_object() {
            for (key, previous) in shape_fields {
                if key == ID_FIELD || key == TYPENAME_FIELD {
                    continue;
                }
                let current = record.get(key).unwrap_or(&Value::Null);
                fields.insert(key.clone(), self.derive(current, previous));
            }
        }

        Value::Object(fields)
    }

    /// Denormalize a stored field value, following `previous` for nested shapes
    pub fn derive(&self, current: &Value, previous: &Value) -> Value {
        match current {
            Value::Ref(reference) => match self.table.get(reference.id.as_str()) {
                None => Value::Null,
                Some(record) if is_entity_object(previous) => self.derive_entity(record, previous),
                Some(_) => current.clone(),
            },
            Value::Array(items) if Value::is_entity_array(items) => {
                self.derive_entity_array(items, previous)
            }
            Value::Array(items) => {
                let previous = previous.as_array();
                Value::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| {
                            let shape = previous.and_then(|p| p.get(i)).unwrap_or(&Value::Null);
                            self.derive(item, shape)
                        })
                        .collect(),
                )
            }
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, child)| {
                        let shape = previous.get(key).unwrap_or(&Value::Null);
                        (key.clone(), self.derive(child, shape))
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Each element reuses the shape it had before, or the shape of its first
    /// entity-shaped sibling when it is new
    fn derive_entity_array(&self, items: &[Value], previous: &Value) -> Value {
        let previous = previous.as_array().map(Vec::as_slice).unwrap_or_default();
        let fallback = previous.iter().find(|item| is_entity_object(item));

        let stored: Vec<Reference> = items.iter().filter_map(Value::entity_ref).collect();
        let ordered: Vec<Reference> = match self.order {
            ArrayOrder::Stored => stored,
            ArrayOrder::Snapshot => {
                let stored_ids: HashSet<&EntityId> = stored.iter().map(|r| &r.id).collect();
                let previous_ids: HashSet<EntityId> = previous
                    .iter()
                    .filter_map(|item| item.entity_ref().map(|r| r.id))
                    .collect();
                let survivors = previous
                    .iter()
                    .filter_map(Value::entity_ref)
                    .filter(|r| stored_ids.contains(&r.id));
                let fresh = stored
                    .iter()
                    .filter(|r| !previous_ids.contains(&r.id))
                    .cloned();
                survivors.chain(fresh).collect()
            }
        };

        Value::Array(
            ordered
                .into_iter()
                .filter_map(|reference| {
                    let record = self.table.get(reference.id.as_str())?;
                    let shape = previous
                        .iter()
                        .find(|p| {
                            is_entity_object(p)
                                && p.entity_ref().is_some_and(|r| r.id == reference.id)
                        })
                        .or(fallback);
                    Some(match shape {
                        Some(shape) => self.derive_entity(record, shape),
                        None => Value::Ref(reference),
                    })
                })
                .collect(),
        )
    }
}

fn is_entity_object(value: &Value) -> bool {
    matches!(value, Value::Object(_)) && value.entity_ref().is_some()
}
