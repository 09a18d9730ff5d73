//! Normalizer
//!
//! Walks a denormalized tree depth first, merges every entity-shaped object
//! into the staged table, and records one update event per observed change.
//! Nested entities are merged before their holder so that the holder stores a
//! [`Value::Ref`] to an already-merged record.
//!
//! Arrays of entities below an entity need a [`MergePolicy`], including ones
//! nested inside plain arrays; the existing stored array is found by resolving
//! the same [`Path`] against the holder's current record.

use super::associations;
use super::callbacks::{EntityDirective, FieldTransformer, MergePolicy, StoreCallbacks};
use super::events::UpdateEvent;
use super::table::Staging;
use crate::config::StoreConfig;
use crate::graph::value::{identity_of, ID_FIELD, TYPENAME_FIELD};
use crate::graph::{EntityId, Fields, Identity, Path, Record, Reference, Tombstone, Value};
use crate::{CacheError, Result};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace, warn};

/// Field transformers keyed by typename, then field
pub(crate) type Transformers = HashMap<String, HashMap<String, FieldTransformer>>;

/// Relation fields whose arrays were derived from foreign keys
pub(crate) type DerivedRelations = HashSet<(EntityId, String)>;

/// Nearest enclosing entity while walking its fields
struct Owner {
    reference: Reference,
    existing: Option<Fields>,
}

/// Result of one normalization pass
pub(crate) struct NormalizeOutput<'s> {
    pub staging: Staging<'s>,
    pub events: Vec<UpdateEvent>,
    pub touched: BTreeSet<EntityId>,
    pub deleted: Vec<Reference>,
}

pub(crate) struct Normalizer<'a, 's> {
    staging: Staging<'s>,
    config: &'a StoreConfig,
    transformers: &'a Transformers,
    callbacks: &'a StoreCallbacks,
    derived: &'a DerivedRelations,
    events: Vec<UpdateEvent>,
    created: HashSet<EntityId>,
    touched: BTreeSet<EntityId>,
    deleted: Vec<Reference>,
}

impl<'a, 's> Normalizer<'a, 's> {
    pub fn new(
        staging: Staging<'s>,
        config: &'a StoreConfig,
        transformers: &'a Transformers,
        callbacks: &'a StoreCallbacks,
        derived: &'a DerivedRelations,
    ) -> Self {
        Self {
            staging,
            config,
            transformers,
            callbacks,
            derived,
            events: Vec::new(),
            created: HashSet::new(),
            touched: BTreeSet::new(),
            deleted: Vec::new(),
        }
    }

    /// Normalize a whole tree into the staged table
    pub fn run(mut self, tree: &Value) -> Result<NormalizeOutput<'s>> {
        self.normalize(tree, None, &Path::root())?;

        debug!(
            events = self.events.len(),
            touched = self.touched.len(),
            deleted = self.deleted.len(),
            "Normalization pass complete"
        );

        Ok(NormalizeOutput {
            staging: self.staging,
            events: self.events,
            touched: self.touched,
            deleted: self.deleted,
        })
    }

    fn normalize(&mut self, value: &Value, owner: Option<&Owner>, path: &Path) -> Result<Value> {
        match value {
            Value::Object(fields) => match identity_of(fields) {
                Identity::Partial(present) => Err(CacheError::PartialIdentity {
                    path: describe(owner, path),
                    present,
                }),
                Identity::Entity(reference) => {
                    if let Some(kind) = value.tombstone_kind() {
                        self.apply_tombstone(&reference, kind);
                        return Ok(Value::Null);
                    }
                    self.normalize_entity(&reference, value)?;
                    Ok(Value::Ref(reference))
                }
                Identity::Plain => Ok(Value::Object(self.normalize_fields(value, owner, path)?)),
            },
            Value::Array(items) => {
                let mut normalized = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    if let (Some(reference), Some(kind)) = (item.entity_ref(), item.tombstone_kind())
                    {
                        self.apply_tombstone(&reference, kind);
                        continue;
                    }
                    normalized.push(self.normalize(item, owner, &path.index(index))?);
                }
                Ok(Value::Array(normalized))
            }
            other => Ok(other.clone()),
        }
    }

    fn normalize_fields(
        &mut self,
        object: &Value,
        owner: Option<&Owner>,
        path: &Path,
    ) -> Result<Fields> {
        let Some(fields) = object.as_object() else {
            return Ok(Fields::new());
        };

        let mut normalized = Fields::new();
        for (key, child) in fields {
            let child_path = path.field(key);
            let value = match (owner, child) {
                (Some(owner), Value::Array(items))
                    if items.is_empty() || Value::is_entity_array(items) =>
                {
                    self.entity_array(items, owner, key, object, &child_path)?
                }
                (Some(owner), Value::Array(items)) => {
                    self.nested_array(items, owner, key, object, &child_path)?
                }
                _ => self.normalize(child, owner, &child_path)?,
            };
            normalized.insert(key.clone(), value);
        }
        Ok(normalized)
    }

    /// Array of entities below an entity; merged under a policy for `field`
    fn entity_array(
        &mut self,
        items: &[Value],
        owner: &Owner,
        field: &str,
        parent: &Value,
        path: &Path,
    ) -> Result<Value> {
        match self.merge_policy(owner, field, parent, path) {
            Some(policy) => self.merge_entity_array(items, owner, path, policy),
            None if items.is_empty() => Ok(Value::Array(Vec::new())),
            None => Err(CacheError::NoMergePolicy {
                typename: owner.reference.typename.clone(),
                field: path.to_string(),
            }),
        }
    }

    /// Array below an entity that is not itself an array of entities
    ///
    /// Elements are normalized positionally, except that non-empty arrays of
    /// entities found inside (e.g. `grid: [[entity, ..], ..]`) are merged under
    /// the policy of the enclosing `field`.
    fn nested_array(
        &mut self,
        items: &[Value],
        owner: &Owner,
        field: &str,
        parent: &Value,
        path: &Path,
    ) -> Result<Value> {
        let mut normalized = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if let (Some(reference), Some(kind)) = (item.entity_ref(), item.tombstone_kind()) {
                self.apply_tombstone(&reference, kind);
                continue;
            }
            let item_path = path.index(index);
            let value = match item {
                Value::Array(inner) if Value::is_entity_array(inner) => {
                    self.entity_array(inner, owner, field, parent, &item_path)?
                }
                Value::Array(inner) => self.nested_array(inner, owner, field, parent, &item_path)?,
                _ => self.normalize(item, Some(owner), &item_path)?,
            };
            normalized.push(value);
        }
        Ok(Value::Array(normalized))
    }

    fn normalize_entity(&mut self, reference: &Reference, value: &Value) -> Result<()> {
        trace!(entity = %reference, "Normalizing entity");

        let transformed = self.apply_transformers(&reference.typename, value);
        let owner = Owner {
            reference: reference.clone(),
            existing: self
                .staging
                .get(reference.id.as_str())
                .map(|record| record.fields.clone()),
        };

        let mut incoming = self.normalize_fields(&transformed, Some(&owner), &Path::root())?;
        incoming.remove(ID_FIELD);
        incoming.remove(TYPENAME_FIELD);

        self.merge_record(reference, incoming);
        self.run_entity_hook(reference);
        Ok(())
    }

    fn apply_transformers<'v>(&self, typename: &str, value: &'v Value) -> Cow<'v, Value> {
        let (Some(transformers), Some(fields)) = (self.transformers.get(typename), value.as_object())
        else {
            return Cow::Borrowed(value);
        };

        let mut transformed: Option<Fields> = None;
        for (key, raw) in fields {
            if let Some(transform) = transformers.get(key) {
                transformed
                    .get_or_insert_with(|| fields.clone())
                    .insert(key.clone(), transform(raw.clone()));
            }
        }

        match transformed {
            Some(fields) => Cow::Owned(Value::Object(fields)),
            None => Cow::Borrowed(value),
        }
    }

    /// Shallow-merge incoming fields; fields absent from the payload survive
    fn merge_record(&mut self, reference: &Reference, incoming: Fields) {
        let incoming_keys: Vec<String> = incoming.keys().cloned().collect();

        if self.staging.contains(reference.id.as_str()) {
            for (key, value) in incoming {
                self.set_field(reference, &key, value);
            }
        } else {
            self.staging.put(Record {
                id: reference.id.clone(),
                typename: reference.typename.clone(),
                fields: incoming,
            });
            self.deleted.retain(|deleted| deleted.id != reference.id);
            self.created.insert(reference.id.clone());
            self.events.push(UpdateEvent::created(reference.clone()));
            trace!(entity = %reference, "Created record");
        }
        self.touched.insert(reference.id.clone());

        // Relation supplied without its foreign key: derive the key from the merged relation
        let derived: Vec<(String, Value)> = self
            .config
            .references(&reference.typename)
            .filter(|(fk, r)| {
                incoming_keys.contains(&r.field) && !incoming_keys.iter().any(|k| k == fk)
            })
            .filter_map(|(fk, r)| {
                let relation = self.staging.get(reference.id.as_str())?.fields.get(&r.field)?;
                Some((fk.to_string(), associations::foreign_key_from_relation(relation)?))
            })
            .collect();
        for (foreign_key, value) in derived {
            self.set_field(reference, &foreign_key, value);
        }
    }

    /// Write one field, announcing it when the value changed
    fn set_field(&mut self, reference: &Reference, field: &str, value: Value) {
        let announce = !self.created.contains(&reference.id);
        let Some(record) = self.staging.get_mut(reference.id.as_str()) else {
            return;
        };

        let changed = record
            .fields
            .get(field)
            .is_none_or(|old| !old.diff_eq(&value));
        record.fields.insert(field.to_string(), value);

        if changed && announce {
            self.events
                .push(UpdateEvent::updated(reference.clone(), field));
        }
        self.touched.insert(reference.id.clone());
    }

    fn run_entity_hook(&mut self, reference: &Reference) {
        let Some(hook) = self.callbacks.on_fetch_entity.clone() else {
            return;
        };
        let Some(record) = self.staging.get(reference.id.as_str()).cloned() else {
            return;
        };
        for directive in hook(&record) {
            self.apply_directive(directive);
        }
    }

    fn apply_directive(&mut self, directive: EntityDirective) {
        match directive {
            EntityDirective::Update { id, field, updater } => {
                let Some(record) = self.staging.get(id.as_str()) else {
                    warn!(id = %id, field = %field, "Update directive for unknown record");
                    return;
                };
                let reference = record.reference();
                let value = updater(record.fields.get(&field));
                self.set_field(&reference, &field, value);
            }
            EntityDirective::Remove(id) => {
                if let Some(reference) = self.staging.get(id.as_str()).map(Record::reference) {
                    self.delete_record(&reference);
                }
            }
        }
    }

    fn apply_tombstone(&mut self, reference: &Reference, kind: Tombstone) {
        match kind {
            Tombstone::Unlink => trace!(entity = %reference, "Unlinking entity"),
            Tombstone::Delete => self.delete_record(reference),
        }
    }

    fn delete_record(&mut self, reference: &Reference) {
        if let Some(record) = self.staging.remove(&reference.id) {
            let reference = record.reference();
            debug!(entity = %reference, "Deleted record");
            self.created.remove(&reference.id);
            self.touched.remove(&reference.id);
            self.events.push(UpdateEvent::deleted(reference.clone()));
            self.deleted.push(reference);
        }
    }

    fn merge_policy(
        &self,
        owner: &Owner,
        field: &str,
        parent: &Value,
        path: &Path,
    ) -> Option<MergePolicy> {
        if path.segments().len() == 1
            && self
                .derived
                .contains(&(owner.reference.id.clone(), field.to_string()))
        {
            return Some(MergePolicy::Override);
        }
        if let Some(hook) = &self.callbacks.on_fetch_array_of_entities {
            if let Some(policy) = hook(field, parent) {
                return Some(policy);
            }
        }
        self.config.merge_policy(&owner.reference.typename, field)
    }

    fn merge_entity_array(
        &mut self,
        items: &[Value],
        owner: &Owner,
        path: &Path,
        policy: MergePolicy,
    ) -> Result<Value> {
        let mut kept = Vec::with_capacity(items.len());
        let mut removed = HashSet::new();
        let mut incoming_ids = HashSet::new();

        for (index, item) in items.iter().enumerate() {
            let Some(reference) = item.entity_ref() else {
                continue;
            };
            incoming_ids.insert(reference.id.clone());

            if let Some(kind) = item.tombstone_kind() {
                self.apply_tombstone(&reference, kind);
                removed.insert(reference.id);
                continue;
            }

            let normalized = self.normalize(item, Some(owner), &path.index(index))?;
            if !normalized.is_null() {
                kept.push(normalized);
            }
        }

        let existing: Vec<Value> = owner
            .existing
            .as_ref()
            .and_then(|fields| path.resolve_in(fields))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let merged = match policy {
            MergePolicy::Append => {
                let mut merged: Vec<Value> = existing
                    .into_iter()
                    .filter(|value| !has_id_in(value, &removed))
                    .collect();
                let mut present: HashSet<EntityId> = merged
                    .iter()
                    .filter_map(|value| value.entity_ref().map(|r| r.id))
                    .collect();
                for value in kept {
                    let fresh = value
                        .entity_ref()
                        .is_none_or(|reference| present.insert(reference.id));
                    if fresh {
                        merged.push(value);
                    }
                }
                merged
            }
            MergePolicy::Override => kept,
            MergePolicy::Remove => existing
                .into_iter()
                .filter(|value| !has_id_in(value, &incoming_ids))
                .collect(),
        };

        trace!(
            entity = %owner.reference,
            field = %path,
            ?policy,
            len = merged.len(),
            "Merged array of entities"
        );
        Ok(Value::Array(merged))
    }
}

fn has_id_in(value: &Value, ids: &HashSet<EntityId>) -> bool {
    value
        .entity_ref()
        .is_some_and(|reference| ids.contains(&reference.id))
}

fn describe(owner: Option<&Owner>, path: &Path) -> String {
    match owner {
        Some(owner) if path.is_root() => owner.reference.to_string(),
        Some(owner) => format!("{}.{}", owner.reference, path),
        None if path.is_root() => "<root>".to_string(),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::UpdateKind;
    use crate::store::table::EntityTable;
    use serde_json::json;

    fn run(
        table: &EntityTable,
        tree: serde_json::Value,
        config: &StoreConfig,
        callbacks: &StoreCallbacks,
    ) -> Result<(Vec<UpdateEvent>, EntityTable)> {
        let transformers = Transformers::new();
        let derived = DerivedRelations::new();
        let output = Normalizer::new(
            Staging::new(table),
            config,
            &transformers,
            callbacks,
            &derived,
        )
        .run(&Value::from(tree))?;
        let mut next = table.clone();
        next.apply(output.staging.into_changes());
        Ok((output.events, next))
    }

    #[test]
    fn test_new_record_emits_single_create() {
        let table = EntityTable::new();
        let (events, table) = run(
            &table,
            json!({"id": "p1", "typename": "Person", "name": "Ada", "age": 36}),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpdateKind::CreateEntity);
        assert_eq!(table.get("p1").unwrap().get("name"), Some(&Value::from("Ada")));
        assert!(table.get("p1").unwrap().get("id").is_none());
    }

    #[test]
    fn test_shallow_merge_keeps_absent_fields() {
        let mut table = EntityTable::new();
        table.insert(
            Record::new("p1", "Person")
                .with_field("name", "Ada")
                .with_field("age", 36),
        );

        let (events, table) = run(
            &table,
            json!({"id": "p1", "typename": "Person", "name": "Ada L."}),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap();

        assert_eq!(events, vec![UpdateEvent::updated(Reference::new("p1", "Person"), "name")]);
        assert_eq!(table.get("p1").unwrap().get("age"), Some(&Value::from(36)));
    }

    #[test]
    fn test_nested_entity_becomes_reference() {
        let table = EntityTable::new();
        let (events, table) = run(
            &table,
            json!({
                "id": "post1", "typename": "Post",
                "author": {"id": "u1", "typename": "User", "name": "Ada"}
            }),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        // nested entity merged first
        assert_eq!(events[0].id().as_str(), "u1");
        assert_eq!(
            table.get("post1").unwrap().get("author"),
            Some(&Value::reference("u1", "User"))
        );
    }

    #[test]
    fn test_partial_identity_is_rejected() {
        let table = EntityTable::new();
        let err = run(
            &table,
            json!({"id": "p1", "typename": "Person", "meta": {"id": "m1"}}),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap_err();

        match err {
            CacheError::PartialIdentity { path, present } => {
                assert_eq!(path, "Person:p1.meta");
                assert_eq!(present, "id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_entity_array_without_policy_fails() {
        let table = EntityTable::new();
        let err = run(
            &table,
            json!({
                "id": "p1", "typename": "Person",
                "phones": [{"id": "ph1", "typename": "Phone"}]
            }),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no or invalid merge policy for field phones"));
    }

    #[test]
    fn test_config_policy_used_when_no_hook() {
        let mut table = EntityTable::new();
        table.insert(Record::new("p1", "Person").with_field(
            "phones",
            Value::Array(vec![Value::reference("ph1", "Phone")]),
        ));
        table.insert(Record::new("ph1", "Phone"));

        let config = StoreConfig::new().with_merge_policy("Person", "phones", MergePolicy::Append);
        let (_, table) = run(
            &table,
            json!({
                "id": "p1", "typename": "Person",
                "phones": [{"id": "ph2", "typename": "Phone"}]
            }),
            &config,
            &StoreCallbacks::new(),
        )
        .unwrap();

        let phones = table.get("p1").unwrap().get("phones").unwrap();
        assert_eq!(phones.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_top_level_entity_list_needs_no_policy() {
        let table = EntityTable::new();
        let (events, table) = run(
            &table,
            json!({"people": [
                {"id": "p1", "typename": "Person"},
                {"id": "p2", "typename": "Person"}
            ]}),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_arrays_of_arrays_recurse_positionally() {
        let mut table = EntityTable::new();
        table.insert(Record::new("g1", "Grid").with_field("cells", Value::from(json!([[1, 2], [3]]))));

        let (events, table) = run(
            &table,
            json!({"id": "g1", "typename": "Grid", "cells": [[1, 2], [4]]}),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(
            table.get("g1").unwrap().get("cells"),
            Some(&Value::from(json!([[1, 2], [4]])))
        );
    }

    #[test]
    fn test_entity_arrays_inside_arrays_need_policy() {
        let table = EntityTable::new();
        let err = run(
            &table,
            json!({
                "id": "b1", "typename": "Board",
                "grid": [[{"id": "c1", "typename": "Cell"}]]
            }),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::NoMergePolicy { ref field, .. } if field == "grid[0]"));
    }

    #[test]
    fn test_entity_arrays_inside_arrays_merge_in_place() {
        let mut table = EntityTable::new();
        table.insert(Record::new("b1", "Board").with_field(
            "grid",
            Value::Array(vec![
                Value::Array(vec![Value::reference("c1", "Cell")]),
                Value::Array(vec![Value::reference("c2", "Cell")]),
            ]),
        ));
        table.insert(Record::new("c1", "Cell"));
        table.insert(Record::new("c2", "Cell"));

        let (_, table) = run(
            &table,
            json!({
                "id": "b1", "typename": "Board",
                "grid": [[{"id": "c3", "typename": "Cell"}], [{"id": "c4", "typename": "Cell"}]]
            }),
            &StoreConfig::new(),
            &StoreCallbacks::new().with_array_policy("grid", MergePolicy::Append),
        )
        .unwrap();

        assert_eq!(
            table.get("b1").unwrap().get("grid"),
            Some(&Value::Array(vec![
                Value::Array(vec![Value::reference("c1", "Cell"), Value::reference("c3", "Cell")]),
                Value::Array(vec![Value::reference("c2", "Cell"), Value::reference("c4", "Cell")]),
            ]))
        );
    }

    #[test]
    fn test_directives_update_and_remove() {
        let mut table = EntityTable::new();
        table.insert(Record::new("p1", "Person").with_field("visits", 1));
        table.insert(Record::new("stale", "Person"));

        let callbacks = StoreCallbacks::new().with_on_fetch_entity(|record| {
            if record.id.as_str() != "p1" {
                return Vec::new();
            }
            vec![
                EntityDirective::update("p1", "visits", |old| {
                    let n = old.and_then(|v| match v {
                        Value::Number(n) => n.as_i64(),
                        _ => None,
                    });
                    Value::from(n.unwrap_or(0) + 1)
                }),
                EntityDirective::remove("stale"),
            ]
        });

        let (events, table) = run(
            &table,
            json!({"id": "p1", "typename": "Person", "name": "Ada"}),
            &StoreConfig::new(),
            &callbacks,
        )
        .unwrap();

        assert_eq!(table.get("p1").unwrap().get("visits"), Some(&Value::from(2)));
        assert!(!table.contains("stale"));
        assert!(events
            .iter()
            .any(|e| e.kind == UpdateKind::UpdateProp && e.prop_name.as_deref() == Some("visits")));
        assert!(events
            .iter()
            .any(|e| e.kind == UpdateKind::DeleteEntity && e.id().as_str() == "stale"));
    }

    #[test]
    fn test_failed_pass_leaves_table_untouched() {
        let table = EntityTable::new();
        let result = run(
            &table,
            json!([
                {"id": "p1", "typename": "Person"},
                {"typename": "Broken"}
            ]),
            &StoreConfig::new(),
            &StoreCallbacks::new(),
        );
        assert!(result.is_err());
        assert!(table.is_empty());
    }
}
