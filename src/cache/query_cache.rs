//! Per-query snapshot cache
//!
//! Holds one denormalized snapshot and keeps it current either by full
//! re-derivation from the table ([`QueryCache::refresh`]) or by patching
//! only the nodes an event touches ([`QueryCache::apply_update`]). Both paths
//! produce the same tree for the same table state.
//!
//! Snapshots are shared as `Arc<Value>`; an update that changes nothing keeps
//! the same `Arc`, so readers can detect changes with [`Arc::ptr_eq`].

use super::denormalize::{ArrayOrder, Denormalizer};
use super::WatchTemplate;
use crate::graph::{EntityId, Fields, Value};
use crate::store::{Store, StoreOutcome, UpdateEvent, UpdateKind};
use std::sync::Arc;
use tracing::trace;

/// Snapshot of one query's result
#[derive(Debug, Clone)]
pub struct QueryCache {
    store: Store,
    snapshot: Option<Arc<Value>>,
    template: WatchTemplate,
    freshly_fetched: bool,
}

impl QueryCache {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            snapshot: None,
            template: WatchTemplate::new(),
            freshly_fetched: false,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn get(&self) -> Option<Arc<Value>> {
        self.snapshot.clone()
    }

    pub fn is_cached(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn watch_template(&self) -> &WatchTemplate {
        &self.template
    }

    /// Replace the snapshot and rebuild its template
    pub fn set(&mut self, data: Value) -> Arc<Value> {
        self.template = WatchTemplate::from_snapshot(&data);
        let snapshot = Arc::new(data);
        self.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Seed from a store call; the next [`QueryCache::resolve`] returns it as is
    pub fn seed(&mut self, outcome: StoreOutcome) -> Arc<Value> {
        let snapshot = Arc::new(outcome.data);
        self.snapshot = Some(Arc::clone(&snapshot));
        self.template = outcome.updates_to_listen_to;
        self.freshly_fetched = true;
        snapshot
    }

    /// Current snapshot, re-derived unless it was just seeded
    pub fn resolve(&mut self) -> Option<Arc<Value>> {
        if std::mem::take(&mut self.freshly_fetched) {
            return self.get();
        }
        self.refresh()
    }

    /// Re-derive the snapshot from the table
    pub fn refresh(&mut self) -> Option<Arc<Value>> {
        let current = self.snapshot.clone()?;
        let refreshed = self
            .store
            .read(|table| Denormalizer::new(table, ArrayOrder::Snapshot).refresh_tree(&current));
        if refreshed != *current {
            trace!("Snapshot changed on refresh");
            self.set(refreshed);
        }
        self.get()
    }

    /// Patch the snapshot for one event; returns whether it changed
    pub fn apply_update(&mut self, event: &UpdateEvent) -> bool {
        let Some(current) = self.snapshot.clone() else {
            return false;
        };

        let patched = match event.kind {
            UpdateKind::CreateEntity => None,
            UpdateKind::DeleteEntity => {
                if is_node_of(&current, event.id()) {
                    Some(Value::Null)
                } else {
                    patch_delete(&current, event.id())
                }
            }
            UpdateKind::UpdateProp => match event.prop_name.as_deref() {
                Some(prop) => self.store.read(|table| {
                    let denormalizer = Denormalizer::new(table, ArrayOrder::Snapshot);
                    patch_prop(&current, event.id(), prop, &denormalizer)
                }),
                None => None,
            },
        };

        match patched {
            Some(value) => {
                trace!(entity = %event.entity, kind = ?event.kind, "Patched snapshot");
                self.set(value);
                true
            }
            None => false,
        }
    }

    /// Patch for a batch of events; returns whether anything changed
    pub fn apply_updates(&mut self, events: &[UpdateEvent]) -> bool {
        events
            .iter()
            .fold(false, |changed, event| self.apply_update(event) | changed)
    }

    /// Forget the snapshot entirely
    pub fn invalidate(&mut self) {
        self.snapshot = None;
        self.template = WatchTemplate::new();
        self.freshly_fetched = false;
    }
}

fn is_node_of(value: &Value, id: &EntityId) -> bool {
    value.entity_ref().is_some_and(|reference| reference.id == *id)
}

/// Remove every node of `id`: `Null` in object slots, spliced from arrays
fn patch_delete(node: &Value, id: &EntityId) -> Option<Value> {
    match node {
        Value::Object(fields) => {
            let mut patched: Option<Fields> = None;
            for (key, child) in fields {
                let replacement = if is_node_of(child, id) {
                    Some(Value::Null)
                } else {
                    patch_delete(child, id)
                };
                if let Some(value) = replacement {
                    patched
                        .get_or_insert_with(|| fields.clone())
                        .insert(key.clone(), value);
                }
            }
            patched.map(Value::Object)
        }
        Value::Array(items) => {
            let mut changed = false;
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                if is_node_of(item, id) {
                    changed = true;
                    continue;
                }
                match patch_delete(item, id) {
                    Some(value) => {
                        changed = true;
                        kept.push(value);
                    }
                    None => kept.push(item.clone()),
                }
            }
            changed.then_some(Value::Array(kept))
        }
        _ => None,
    }
}

/// Re-derive `prop` on every entity node of `id` that selects it
fn patch_prop(
    node: &Value,
    id: &EntityId,
    prop: &str,
    denormalizer: &Denormalizer<'_>,
) -> Option<Value> {
    match node {
        Value::Object(fields) => {
            let mut patched: Option<Fields> = None;
            let mut replaced = false;

            if is_node_of(node, id) {
                if let (Some(previous), Some(record)) =
                    (fields.get(prop), denormalizer.table().get(id.as_str()))
                {
                    let next = denormalizer.derive(record.get(prop).unwrap_or(&Value::Null), previous);
                    if next != *previous {
                        patched
                            .get_or_insert_with(|| fields.clone())
                            .insert(prop.to_string(), next);
                    }
                    replaced = true;
                }
            }

            for (key, child) in fields {
                if replaced && key == prop {
                    continue;
                }
                if let Some(value) = patch_prop(child, id, prop, denormalizer) {
                    patched
                        .get_or_insert_with(|| fields.clone())
                        .insert(key.clone(), value);
                }
            }
            patched.map(Value::Object)
        }
        Value::Array(items) => {
            let mut changed = false;
            let patched: Vec<Value> = items
                .iter()
                .map(|item| match patch_prop(item, id, prop, denormalizer) {
                    Some(value) => {
                        changed = true;
                        value
                    }
                    None => item.clone(),
                })
                .collect();
            changed.then_some(Value::Array(patched))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreCallbacks;
    use crate::store::MergePolicy;
    use serde_json::json;

    async fn seeded(tree: serde_json::Value) -> (Store, QueryCache) {
        let store = Store::default();
        let mut cache = QueryCache::new(store.clone());
        let outcome = store
            .store(tree, &StoreCallbacks::new().with_array_policy("phones", MergePolicy::Append))
            .await
            .unwrap();
        cache.seed(outcome);
        (store, cache)
    }

    fn person_tree() -> serde_json::Value {
        json!({"person": {
            "id": "p1", "typename": "Person", "name": "Ada",
            "phones": [
                {"id": "ph1", "typename": "Phone", "number": "111"},
                {"id": "ph2", "typename": "Phone", "number": "222"}
            ]
        }})
    }

    #[tokio::test]
    async fn test_resolve_returns_seed_once() {
        let (_, mut cache) = seeded(person_tree()).await;
        let first = cache.get().unwrap();
        let resolved = cache.resolve().unwrap();
        assert!(Arc::ptr_eq(&first, &resolved));
        // nothing changed, refresh keeps the same allocation
        let again = cache.resolve().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_patch_matches_refresh() {
        let (store, mut patched) = seeded(person_tree()).await;
        let mut refreshed = patched.clone();

        let outcome = store
            .store(
                json!({"id": "ph1", "typename": "Phone", "number": "999"}),
                &StoreCallbacks::new(),
            )
            .await
            .unwrap();

        assert!(patched.apply_updates(&outcome.updates));
        refreshed.refresh();
        assert_eq!(patched.get(), refreshed.get());
        assert_eq!(
            patched.get().unwrap().get("person").and_then(|p| p.get("phones")),
            Some(&Value::from(json!([
                {"id": "ph1", "typename": "Phone", "number": "999"},
                {"id": "ph2", "typename": "Phone", "number": "222"}
            ])))
        );
    }

    #[tokio::test]
    async fn test_reorder_only_override_agrees() {
        let (store, mut patched) = seeded(person_tree()).await;
        let mut refreshed = patched.clone();

        let outcome = store
            .store(
                json!({"id": "p1", "typename": "Person", "phones": [
                    {"id": "ph2", "typename": "Phone"},
                    {"id": "ph1", "typename": "Phone"}
                ]}),
                &StoreCallbacks::new().with_array_policy("phones", MergePolicy::Override),
            )
            .await
            .unwrap();

        assert!(outcome.updates.is_empty());
        assert!(!patched.apply_updates(&outcome.updates));
        refreshed.refresh();
        assert_eq!(patched.get(), refreshed.get());
    }

    #[tokio::test]
    async fn test_delete_splices_arrays() {
        let (store, mut cache) = seeded(person_tree()).await;
        let outcome = store
            .store(
                json!({"id": "ph2", "typename": "Phone", "__tombstone": "delete"}),
                &StoreCallbacks::new(),
            )
            .await
            .unwrap();

        assert!(cache.apply_updates(&outcome.updates));
        let phones = cache
            .get()
            .unwrap()
            .get("person")
            .and_then(|p| p.get("phones"))
            .cloned();
        assert_eq!(
            phones,
            Some(Value::from(json!([{"id": "ph1", "typename": "Phone", "number": "111"}])))
        );
    }

    #[tokio::test]
    async fn test_unrelated_update_keeps_snapshot() {
        let (store, mut cache) = seeded(person_tree()).await;
        let before = cache.get().unwrap();
        let outcome = store
            .store(json!({"id": "p1", "typename": "Person", "age": 36}), &StoreCallbacks::new())
            .await
            .unwrap();

        assert!(!cache.watch_template().matches_any(&outcome.updates));
        assert!(!cache.apply_updates(&outcome.updates));
        assert!(Arc::ptr_eq(&before, &cache.get().unwrap()));
    }

    #[tokio::test]
    async fn test_invalidate_clears() {
        let (_, mut cache) = seeded(person_tree()).await;
        cache.invalidate();
        assert!(!cache.is_cached());
        assert!(cache.resolve().is_none());
    }
}
