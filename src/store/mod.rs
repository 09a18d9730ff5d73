//! Normalized entity store
//!
//! The [`Store`] owns the canonical entity table and the link graph. Each
//! [`Store::store`] call reconciles associations, normalizes the incoming
//! tree into a staged copy of the table, cascades deletions, and commits the
//! result in one step. Listeners registered with [`Store::subscribe`] receive
//! every non-empty batch of update events.
//!
//! # Example
//!
//! ```no_run
//! use normcache::store::{Store, StoreCallbacks};
//! use serde_json::json;
//!
//! # async fn demo() -> normcache::Result<()> {
//! let store = Store::default();
//! let outcome = store
//!     .store(json!({"id": "person1", "typename": "Person", "name": "Ada"}), &StoreCallbacks::new())
//!     .await?;
//! assert_eq!(outcome.updates.len(), 1);
//! # Ok(())
//! # }
//! ```

mod associations;
mod callbacks;
pub mod checks;
mod events;
mod links;
mod normalize;
mod table;

pub use callbacks::{
    EntityDirective, FieldTransformer, MergePolicy, MissingHandler, MissingRelation,
    OnFetchArrayOfEntities, OnFetchEntity, StoreCallbacks, Updater,
};
pub use checks::{InvalidReference, MissingLink};
pub use events::{dedup_events, UpdateEvent, UpdateKind};
pub use links::LinkGraph;
pub use table::EntityTable;

use crate::cache::denormalize::{self, ArrayOrder, Denormalizer};
use crate::cache::WatchTemplate;
use crate::config::StoreConfig;
use crate::graph::{EntityId, Fields, Record, Value};
use crate::Result;
use normalize::{NormalizeOutput, Normalizer, Transformers};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use table::Staging;
use tracing::{debug, info};

/// Callback invoked with each non-empty batch of update events
pub type Listener = Arc<dyn Fn(&[UpdateEvent]) + Send + Sync>;

/// Missing-relation handlers keyed by typename, then foreign-key field
type Handlers = HashMap<String, HashMap<String, Arc<dyn MissingHandler>>>;

/// Result of one [`Store::store`] call
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// The ingested tree re-derived from the committed table
    pub data: Value,

    /// Deduplicated events, in the order they were observed
    pub updates: Vec<UpdateEvent>,

    /// Events that can affect `data`
    pub updates_to_listen_to: WatchTemplate,
}

struct StoreState {
    table: EntityTable,
    links: LinkGraph,
}

struct StoreInner {
    state: RwLock<StoreState>,
    config: StoreConfig,
    transformers: Transformers,
    handlers: Handlers,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

/// Shared handle to a normalized entity store
///
/// Cloning is cheap; every clone sees the same table.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        StoreBuilder::new().build()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("records", &self.len())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a store with the given configuration and no handlers
    pub fn new(config: StoreConfig) -> Self {
        StoreBuilder::new().config(config).build()
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Ingest a denormalized tree
    ///
    /// On error the table is left exactly as it was before the call, except
    /// for anything a missing-relation handler stored while running.
    pub async fn store(
        &self,
        tree: impl Into<Value>,
        callbacks: &StoreCallbacks,
    ) -> Result<StoreOutcome> {
        let mut tree = tree.into();
        let reconciled = associations::reconcile(self, &mut tree, callbacks).await?;

        let (updates, data) = {
            let mut guard = self.write_state();
            let StoreState { table, links } = &mut *guard;
            reconciled.revalidate(&mut tree, table);
            let shape = denormalize::strip_tombstones(&tree);

            let NormalizeOutput {
                mut staging,
                mut events,
                touched,
                deleted,
            } = Normalizer::new(
                Staging::new(table),
                &self.inner.config,
                &self.inner.transformers,
                callbacks,
                &reconciled.derived,
            )
            .run(&tree)?;

            links::cascade(
                links,
                &mut staging,
                &touched,
                &deleted,
                &self.inner.config,
                &mut events,
            );
            let changes = staging.into_changes();
            table.apply(changes);

            let data = Denormalizer::new(table, ArrayOrder::Stored).refresh_tree(&shape);
            (dedup_events(events), data)
        };

        debug!(updates = updates.len(), "Stored tree");
        let updates_to_listen_to = WatchTemplate::from_snapshot(&data);
        if !updates.is_empty() {
            self.notify(&updates);
        }

        Ok(StoreOutcome {
            data,
            updates,
            updates_to_listen_to,
        })
    }

    /// Copy of one record
    pub fn get_entity_by_id(&self, id: &str) -> Option<Record> {
        self.read_state().table.get(id).cloned()
    }

    /// Copies of every record of a typename, sorted by id
    pub fn get_entities_by_type(&self, typename: &str) -> Vec<Record> {
        self.read_state()
            .table
            .by_type(typename)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Copies of every record matching all of `predicate`, sorted by id
    pub fn filter_entities(&self, predicate: &Fields) -> Vec<Record> {
        self.read_state()
            .table
            .filter(predicate)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_state().table.contains(id)
    }

    pub fn len(&self) -> usize {
        self.read_state().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records currently referencing `id`
    pub fn holders_of(&self, id: &str) -> Vec<EntityId> {
        self.read_state().links.holders_of(id)
    }

    /// Run `f` against the table under the read lock
    ///
    /// `f` must not call back into this store's write operations.
    pub fn read<R>(&self, f: impl FnOnce(&EntityTable) -> R) -> R {
        f(&self.read_state().table)
    }

    /// Fail with every reference whose target record is absent
    pub fn check_missing_links(&self) -> Result<()> {
        checks::check_missing_links(&self.read_state().table)
    }

    /// Fail with every association whose foreign key and relation disagree
    pub fn check_invalid_references(&self) -> Result<()> {
        checks::check_invalid_references(&self.read_state().table, &self.inner.config)
    }

    /// Register a listener for update batches
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[UpdateEvent]) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        debug!(listener = id, "Added store listener");

        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn missing_handler(
        &self,
        typename: &str,
        foreign_key: &str,
    ) -> Option<Arc<dyn MissingHandler>> {
        self.inner
            .handlers
            .get(typename)
            .and_then(|by_key| by_key.get(foreign_key))
            .cloned()
    }

    // Listeners run without any store lock held so they may call back in
    fn notify(&self, updates: &[UpdateEvent]) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(updates);
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a registered store listener
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
            debug!(listener = self.id, "Removed store listener");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Builder for a [`Store`] with code-level hooks
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    transformers: Transformers,
    handlers: Handlers,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Transform a raw field value before it is merged
    pub fn transformer<F>(
        mut self,
        typename: impl Into<String>,
        field: impl Into<String>,
        transform: F,
    ) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let transform: FieldTransformer = Arc::new(transform);
        self.transformers
            .entry(typename.into())
            .or_default()
            .insert(field.into(), transform);
        self
    }

    /// Handler for ids named by `typename.foreign_key` that are not cached
    pub fn missing_handler(
        mut self,
        typename: impl Into<String>,
        foreign_key: impl Into<String>,
        handler: Arc<dyn MissingHandler>,
    ) -> Self {
        self.handlers
            .entry(typename.into())
            .or_default()
            .insert(foreign_key.into(), handler);
        self
    }

    pub fn build(self) -> Store {
        info!(
            types = self.config.types.len(),
            transformers = self.transformers.values().map(HashMap::len).sum::<usize>(),
            "Created store"
        );
        Store {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState {
                    table: EntityTable::new(),
                    links: LinkGraph::new(),
                }),
                config: self.config,
                transformers: self.transformers,
                handlers: self.handlers,
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_store_returns_denormalized_data() {
        let store = Store::default();
        let outcome = store
            .store(
                json!({"viewer": {
                    "id": "u1", "typename": "User", "name": "Ada",
                    "avatar": {"id": "img1", "typename": "Image", "url": "a.png"}
                }}),
                &StoreCallbacks::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.updates.len(), 2);
        assert_eq!(
            outcome.data.get("viewer").and_then(|v| v.get("avatar")).and_then(|a| a.get("url")),
            Some(&Value::from("a.png"))
        );
        assert_eq!(store.holders_of("img1"), vec![EntityId::new("u1")]);
    }

    #[tokio::test]
    async fn test_second_identical_store_is_silent() {
        let store = Store::default();
        let tree = json!({"id": "p1", "typename": "Person", "name": "Ada"});
        store.store(tree.clone(), &StoreCallbacks::new()).await.unwrap();
        let outcome = store.store(tree, &StoreCallbacks::new()).await.unwrap();
        assert!(outcome.updates.is_empty());
    }

    #[tokio::test]
    async fn test_failed_store_leaves_table_untouched() {
        let store = Store::default();
        store
            .store(json!({"id": "p1", "typename": "Person", "name": "Ada"}), &StoreCallbacks::new())
            .await
            .unwrap();

        let result = store
            .store(
                json!([
                    {"id": "p1", "typename": "Person", "name": "Changed"},
                    {"id": "p2"}
                ]),
                &StoreCallbacks::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(
            store.get_entity_by_id("p1").unwrap().get("name"),
            Some(&Value::from("Ada"))
        );
        assert!(!store.contains("p2"));
    }

    #[tokio::test]
    async fn test_listeners_receive_batches_until_dropped() {
        let store = Store::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = store.subscribe(move |updates| {
            sink.lock().unwrap().push(updates.len());
        });
        assert_eq!(store.listener_count(), 1);

        store
            .store(json!({"id": "p1", "typename": "Person"}), &StoreCallbacks::new())
            .await
            .unwrap();
        // no changes, no notification
        store
            .store(json!({"id": "p1", "typename": "Person"}), &StoreCallbacks::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        subscription.unsubscribe();
        assert_eq!(store.listener_count(), 0);
        store
            .store(json!({"id": "p2", "typename": "Person"}), &StoreCallbacks::new())
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transformer_applies_before_merge() {
        let store = Store::builder()
            .transformer("Person", "name", |value| match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            })
            .build();

        store
            .store(json!({"id": "p1", "typename": "Person", "name": "ada"}), &StoreCallbacks::new())
            .await
            .unwrap();
        assert_eq!(
            store.get_entity_by_id("p1").unwrap().get("name"),
            Some(&Value::from("ADA"))
        );
    }

    #[tokio::test]
    async fn test_query_helpers() {
        let store = Store::default();
        store
            .store(
                json!([
                    {"id": "p2", "typename": "Person", "team": "red"},
                    {"id": "p1", "typename": "Person", "team": "blue"},
                    {"id": "a1", "typename": "Article"}
                ]),
                &StoreCallbacks::new(),
            )
            .await
            .unwrap();

        let people = store.get_entities_by_type("Person");
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].id.as_str(), "p1");

        let mut predicate = Fields::new();
        predicate.insert("team".to_string(), Value::from("red"));
        let red = store.filter_entities(&predicate);
        assert_eq!(red.len(), 1);
        assert_eq!(red[0].id.as_str(), "p2");
        assert_eq!(store.len(), 3);
    }
}
