//! Link graph
//!
//! Tracks which records hold references to which other records so that a
//! deletion can be cascaded to every holder without scanning the table.

use super::associations::foreign_key_from_relation;
use super::events::UpdateEvent;
use super::table::{EntityTable, Staging};
use crate::config::StoreConfig;
use crate::graph::{EntityId, Reference, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// Holder/nested edges between records
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    /// Record id -> ids it references
    nested: HashMap<EntityId, HashSet<EntityId>>,
    /// Record id -> ids referencing it
    holders: HashMap<EntityId, HashSet<EntityId>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from scratch for a whole table
    pub fn from_table(table: &EntityTable) -> Self {
        let mut graph = Self::new();
        for record in table.records() {
            graph.set_edges(&record.id, record.nested_ids());
        }
        graph
    }

    /// Replace every outgoing edge of `holder`
    pub fn set_edges(&mut self, holder: &EntityId, nested: Vec<EntityId>) {
        if let Some(previous) = self.nested.remove(holder) {
            for id in previous {
                self.unlink_holder(&id, holder);
            }
        }
        if nested.is_empty() {
            return;
        }
        for id in &nested {
            self.holders
                .entry(id.clone())
                .or_default()
                .insert(holder.clone());
        }
        self.nested
            .insert(holder.clone(), nested.into_iter().collect());
    }

    /// Records referencing `id`, sorted
    pub fn holders_of(&self, id: &str) -> Vec<EntityId> {
        let mut holders: Vec<_> = self
            .holders
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    /// Records referenced by `id`, sorted
    pub fn nested_in(&self, id: &str) -> Vec<EntityId> {
        let mut nested: Vec<_> = self
            .nested
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        nested.sort();
        nested
    }

    pub fn remove_edge(&mut self, holder: &EntityId, nested: &EntityId) {
        if let Some(set) = self.nested.get_mut(holder) {
            set.remove(nested);
            if set.is_empty() {
                self.nested.remove(holder);
            }
        }
        self.unlink_holder(nested, holder);
    }

    /// Drop a record and every edge touching it
    pub fn remove_entity(&mut self, id: &EntityId) {
        if let Some(nested) = self.nested.remove(id) {
            for target in nested {
                self.unlink_holder(&target, id);
            }
        }
        if let Some(holders) = self.holders.remove(id) {
            for holder in holders {
                if let Some(set) = self.nested.get_mut(&holder) {
                    set.remove(id);
                    if set.is_empty() {
                        self.nested.remove(&holder);
                    }
                }
            }
        }
    }

    fn unlink_holder(&mut self, target: &EntityId, holder: &EntityId) {
        if let Some(set) = self.holders.get_mut(target) {
            set.remove(holder);
            if set.is_empty() {
                self.holders.remove(target);
            }
        }
    }
}

/// Refresh edges of touched records, then strip deleted records from every holder
///
/// Holder fields that lose a reference get an update event. When the pruned
/// field is the relation side of an association, its foreign key is rewritten
/// to match.
pub(crate) fn cascade(
    links: &mut LinkGraph,
    staging: &mut Staging<'_>,
    touched: &BTreeSet<EntityId>,
    deleted: &[Reference],
    config: &StoreConfig,
    events: &mut Vec<UpdateEvent>,
) {
    for id in touched {
        if let Some(record) = staging.get(id.as_str()) {
            links.set_edges(id, record.nested_ids());
        }
    }

    for target in deleted {
        for holder in links.holders_of(target.id.as_str()) {
            let Some(record) = staging.get_mut(holder.as_str()) else {
                continue;
            };
            let holder_ref = record.reference();

            let mut pruned = Vec::new();
            for (field, value) in record.fields.iter_mut() {
                if prune(value, &target.id) {
                    pruned.push(field.clone());
                }
            }

            for field in pruned {
                events.push(UpdateEvent::updated(holder_ref.clone(), field.as_str()));

                let Some((foreign_key, _)) =
                    config.reference_for_relation(&holder_ref.typename, &field)
                else {
                    continue;
                };
                let Some(key_value) = record.fields.get(&field).and_then(foreign_key_from_relation)
                else {
                    continue;
                };
                let changed = record
                    .fields
                    .get(foreign_key)
                    .is_some_and(|old| !old.diff_eq(&key_value));
                if changed {
                    record.fields.insert(foreign_key.to_string(), key_value);
                    events.push(UpdateEvent::updated(holder_ref.clone(), foreign_key));
                }
            }

            trace!(holder = %holder_ref, removed = %target, "Pruned reference");
            links.remove_edge(&holder, &target.id);
        }

        links.remove_entity(&target.id);
        debug!(entity = %target, "Cascaded delete");
    }
}

/// Remove every reference to `id` inside `value`
///
/// A reference in an object slot becomes `Null`; a reference inside an array is
/// spliced out.
fn prune(value: &mut Value, id: &EntityId) -> bool {
    if matches!(value, Value::Ref(reference) if reference.id == *id) {
        *value = Value::Null;
        return true;
    }

    match value {
        Value::Array(items) => {
            let before = items.len();
            items.retain(|item| item.as_ref_value().is_none_or(|r| r.id != *id));
            let mut changed = items.len() != before;
            for item in items.iter_mut() {
                changed |= prune_nested(item, id);
            }
            changed
        }
        Value::Object(fields) => {
            let mut changed = false;
            for child in fields.values_mut() {
                changed |= prune(child, id);
            }
            changed
        }
        _ => false,
    }
}

// Elements left in an array are never bare matches, so only recurse into containers
fn prune_nested(value: &mut Value, id: &EntityId) -> bool {
    match value {
        Value::Array(_) | Value::Object(_) => prune(value, id),
        _ => false,
    }
}
