//! Hooks supplied to a `store()` call or registered on the store

use crate::graph::{EntityId, Record, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How an incoming array of entities merges with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Stored elements minus removed ones, then new incoming elements
    Append,
    /// Incoming elements replace the stored array
    Override,
    /// Stored elements minus every incoming id
    Remove,
}

/// Rewrites one field given its current stored value
pub type Updater = Box<dyn FnOnce(Option<&Value>) -> Value + Send>;

/// Post-merge instruction returned by [`StoreCallbacks::on_fetch_entity`]
pub enum EntityDirective {
    /// Rewrite one already-merged field
    Update {
        id: EntityId,
        field: String,
        updater: Updater,
    },
    /// Delete a record outright
    Remove(EntityId),
}

impl EntityDirective {
    pub fn update<F>(id: impl Into<EntityId>, field: impl Into<String>, updater: F) -> Self
    where
        F: FnOnce(Option<&Value>) -> Value + Send + 'static,
    {
        Self::Update {
            id: id.into(),
            field: field.into(),
            updater: Box::new(updater),
        }
    }

    pub fn remove(id: impl Into<EntityId>) -> Self {
        Self::Remove(id.into())
    }
}

impl fmt::Debug for EntityDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update { id, field, .. } => f
                .debug_struct("Update")
                .field("id", id)
                .field("field", field)
                .finish_non_exhaustive(),
            Self::Remove(id) => f.debug_tuple("Remove").field(id).finish(),
        }
    }
}

/// Request passed to a [`MissingHandler`]
#[derive(Debug, Clone)]
pub struct MissingRelation {
    /// Related ids that are absent or lack required fields
    pub ids: Vec<EntityId>,

    /// Typename the ids are expected to have
    pub typename: String,

    /// Relation field being derived
    pub relation_field: String,

    /// Entity holding the foreign key, as ingested
    pub parent: Value,
}

/// Resolves related entities missing from the table
///
/// Typically fetches the entities and stores them before returning. The
/// store re-reads the table after the handler completes.
#[async_trait]
pub trait MissingHandler: Send + Sync {
    async fn handle_missing(&self, request: &MissingRelation) -> anyhow::Result<()>;
}

/// Called with each merged record; returns follow-up directives
pub type OnFetchEntity = Arc<dyn Fn(&Record) -> Vec<EntityDirective> + Send + Sync>;

/// Called with `(field, parent object)` for each array of entities
pub type OnFetchArrayOfEntities = Arc<dyn Fn(&str, &Value) -> Option<MergePolicy> + Send + Sync>;

/// Transforms an incoming raw field value before it is merged
pub type FieldTransformer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Optional hooks for one `store()` call
#[derive(Clone, Default)]
pub struct StoreCallbacks {
    pub on_fetch_entity: Option<OnFetchEntity>,
    pub on_fetch_array_of_entities: Option<OnFetchArrayOfEntities>,
    /// Fallback for associations with no handler of their own
    pub on_missing_relation: Option<Arc<dyn MissingHandler>>,
}

impl StoreCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_fetch_entity<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> Vec<EntityDirective> + Send + Sync + 'static,
    {
        self.on_fetch_entity = Some(Arc::new(f));
        self
    }

    pub fn with_on_fetch_array_of_entities<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) -> Option<MergePolicy> + Send + Sync + 'static,
    {
        self.on_fetch_array_of_entities = Some(Arc::new(f));
        self
    }

    /// Use one policy for a single field name
    pub fn with_array_policy(self, field: impl Into<String>, policy: MergePolicy) -> Self {
        let field = field.into();
        self.with_on_fetch_array_of_entities(move |name, _| (name == field).then_some(policy))
    }

    pub fn with_on_missing_relation(mut self, handler: Arc<dyn MissingHandler>) -> Self {
        self.on_missing_relation = Some(handler);
        self
    }
}

impl fmt::Debug for StoreCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCallbacks")
            .field("on_fetch_entity", &self.on_fetch_entity.is_some())
            .field(
                "on_fetch_array_of_entities",
                &self.on_fetch_array_of_entities.is_some(),
            )
            .field("on_missing_relation", &self.on_missing_relation.is_some())
            .finish()
    }
}
