//! Foreign-key / relation reconciliation
//!
//! Runs before normalization. For every entity in the incoming tree whose
//! typename declares associations:
//!
//! - relation and foreign key both present: they must name the same ids
//! - foreign key only: the relation is derived from the table or the tree,
//!   invoking a missing-relation handler for ids that cannot be resolved
//! - relation only: nothing here, the normalizer derives the foreign key
//!   after merging

use super::callbacks::{MissingRelation, StoreCallbacks};
use super::normalize::DerivedRelations;
use super::table::EntityTable;
use super::Store;
use crate::config::ReferenceConfig;
use crate::graph::value::identity_of;
use crate::graph::{EntityId, Identity, Path, Reference, Value};
use crate::{CacheError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Target ids named by a foreign key or by a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Linked {
    None,
    One(EntityId),
    Many(Vec<EntityId>),
}

impl Linked {
    /// Parse a foreign-key value: null, an id, or a list of ids
    pub fn from_foreign_key(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Linked::None),
            Value::String(id) => Some(Linked::One(EntityId::new(id.as_str()))),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(EntityId::new))
                .collect::<Option<Vec<_>>>()
                .map(Linked::Many),
            _ => None,
        }
    }

    /// Ids a relation value points at; tombstoned elements are not linked
    pub fn from_relation(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Linked::None),
            Value::Array(items) => Some(Linked::Many(
                items
                    .iter()
                    .filter(|item| item.tombstone_kind().is_none())
                    .filter_map(|item| item.entity_ref().map(|r| r.id))
                    .collect(),
            )),
            other if other.tombstone_kind().is_some() => Some(Linked::None),
            other => other.entity_ref().map(|r| Linked::One(r.id)),
        }
    }

    fn ids(&self) -> Vec<EntityId> {
        match self {
            Linked::None => Vec::new(),
            Linked::One(id) => vec![id.clone()],
            Linked::Many(ids) => ids.clone(),
        }
    }

    /// Same targets, comparing lists as sets
    pub fn agrees_with(&self, other: &Linked) -> bool {
        match (self, other) {
            (Linked::None, Linked::None) => true,
            (Linked::One(a), Linked::One(b)) => a == b,
            (Linked::Many(a), Linked::Many(b)) => {
                a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
            }
            _ => false,
        }
    }

    fn to_foreign_key(&self) -> Value {
        match self {
            Linked::None => Value::Null,
            Linked::One(id) => Value::String(id.to_string()),
            Linked::Many(ids) => {
                Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
            }
        }
    }

    fn to_relation(&self, typename: &str) -> Value {
        match self {
            Linked::None => Value::Null,
            Linked::One(id) => Value::reference(id.clone(), typename),
            Linked::Many(ids) => Value::Array(
                ids.iter()
                    .map(|id| Value::reference(id.clone(), typename))
                    .collect(),
            ),
        }
    }

    fn retain(&mut self, keep: impl Fn(&EntityId) -> bool) {
        match self {
            Linked::One(id) if !keep(id) => *self = Linked::None,
            Linked::Many(ids) => ids.retain(|id| keep(id)),
            _ => {}
        }
    }
}

/// Foreign-key value derived from a merged relation value
pub(crate) fn foreign_key_from_relation(relation: &Value) -> Option<Value> {
    Linked::from_relation(relation).map(|linked| linked.to_foreign_key())
}

/// A relation to derive from a foreign key
struct Pending {
    path: Path,
    owner: Reference,
    parent: Value,
    foreign_key: String,
    reference: ReferenceConfig,
    linked: Linked,
}

/// Entities present in the incoming tree with the fields they carry
type TreeIndex = HashMap<EntityId, HashSet<String>>;

/// A relation written into the tree from a foreign key
struct DerivedLink {
    path: Path,
    owner: Reference,
    foreign_key: String,
    reference: ReferenceConfig,
    linked: Linked,
}

/// Outcome of the association pre-pass
pub(crate) struct Reconciled {
    /// Relation fields whose arrays replace the stored ones when merged
    pub derived: DerivedRelations,
    links: Vec<DerivedLink>,
    tree_ids: HashSet<EntityId>,
}

impl Reconciled {
    /// Drop derived targets that are no longer in the table
    ///
    /// Handlers run while the table is unlocked, so a target resolved before
    /// one of them awaited may have been deleted since. Must be called with
    /// the table write lock held, right before normalization.
    pub fn revalidate(&self, tree: &mut Value, table: &EntityTable) {
        for link in &self.links {
            let mut linked = link.linked.clone();
            linked.retain(|id| self.tree_ids.contains(id) || table.contains(id.as_str()));
            if linked == link.linked {
                continue;
            }

            warn!(
                entity = %link.owner,
                relation = %link.reference.field,
                "Related entities removed while reconciling, dropping"
            );
            if let Some(Value::Object(fields)) = link.path.resolve_mut(tree) {
                fields.insert(
                    link.reference.field.clone(),
                    linked.to_relation(&link.reference.typename),
                );
                fields.insert(link.foreign_key.clone(), linked.to_foreign_key());
            }
        }
    }
}

/// Reconcile every association in `tree`, deriving missing relations in place
pub(crate) async fn reconcile(
    store: &Store,
    tree: &mut Value,
    callbacks: &StoreCallbacks,
) -> Result<Reconciled> {
    let mut pending = Vec::new();
    let mut index = TreeIndex::new();
    collect(store, tree, &Path::root(), &mut index, &mut pending)?;

    let mut derived = DerivedRelations::new();
    let mut links = Vec::with_capacity(pending.len());
    for item in pending {
        let Pending {
            path,
            owner,
            parent,
            foreign_key,
            reference,
            mut linked,
        } = item;

        let missing = unresolved(store, &linked, &reference, &index);
        if !missing.is_empty() {
            let handler = store
                .missing_handler(&owner.typename, &foreign_key)
                .or_else(|| callbacks.on_missing_relation.clone());

            match handler {
                Some(handler) => {
                    debug!(
                        entity = %owner,
                        relation = %reference.field,
                        missing = missing.len(),
                        "Invoking missing-relation handler"
                    );
                    let request = MissingRelation {
                        ids: missing,
                        typename: reference.typename.clone(),
                        relation_field: reference.field.clone(),
                        parent,
                    };
                    handler.handle_missing(&request).await.map_err(|err| {
                        CacheError::Handler(format!("{owner}.{foreign_key}: {err:#}"))
                    })?;

                    let still_missing = unresolved(store, &linked, &reference, &index);
                    if !still_missing.is_empty() {
                        warn!(
                            entity = %owner,
                            relation = %reference.field,
                            ids = ?still_missing,
                            "Related entities still unresolved after handler, dropping"
                        );
                        linked.retain(|id| !still_missing.contains(id));
                    }
                }
                None => {
                    if let Some(absent) = missing
                        .iter()
                        .find(|id| !index.contains_key(*id) && !store.contains(id.as_str()))
                    {
                        return Err(CacheError::MissingEntity {
                            id: absent.clone(),
                            typename: reference.typename.clone(),
                        });
                    }
                    debug!(
                        entity = %owner,
                        relation = %reference.field,
                        "Accepting related entities without required fields"
                    );
                }
            }
        }

        if let Some(Value::Object(fields)) = path.resolve_mut(tree) {
            fields.insert(reference.field.clone(), linked.to_relation(&reference.typename));
            fields.insert(foreign_key.clone(), linked.to_foreign_key());
        }
        derived.insert((owner.id.clone(), reference.field.clone()));
        links.push(DerivedLink {
            path,
            owner,
            foreign_key,
            reference,
            linked,
        });
    }

    Ok(Reconciled {
        derived,
        links,
        tree_ids: index.into_keys().collect(),
    })
}

/// Walk the tree, checking supplied pairs and queueing relations to derive
fn collect(
    store: &Store,
    value: &Value,
    path: &Path,
    index: &mut TreeIndex,
    pending: &mut Vec<Pending>,
) -> Result<()> {
    match value {
        Value::Object(fields) => {
            if let Identity::Entity(owner) = identity_of(fields) {
                if value.tombstone_kind().is_some() {
                    return Ok(());
                }
                index
                    .entry(owner.id.clone())
                    .or_default()
                    .extend(fields.keys().cloned());

                let config = store.config();
                for (foreign_key, reference) in config.references(&owner.typename) {
                    let Some(raw) = fields.get(foreign_key) else {
                        continue;
                    };
                    let linked = Linked::from_foreign_key(raw).ok_or_else(|| {
                        CacheError::InvalidForeignKey {
                            id: owner.id.clone(),
                            field: foreign_key.to_string(),
                        }
                    })?;

                    match fields.get(&reference.field) {
                        Some(relation) => {
                            let agrees = Linked::from_relation(relation)
                                .is_some_and(|related| related.agrees_with(&linked));
                            if !agrees {
                                return Err(CacheError::AssociationMismatch {
                                    id: owner.id.clone(),
                                    relation_field: reference.field.clone(),
                                    foreign_key: foreign_key.to_string(),
                                });
                            }
                        }
                        None => pending.push(Pending {
                            path: path.clone(),
                            owner: owner.clone(),
                            parent: value.clone(),
                            foreign_key: foreign_key.to_string(),
                            reference: reference.clone(),
                            linked,
                        }),
                    }
                }
            }

            for (key, child) in fields {
                collect(store, child, &path.field(key), index, pending)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect(store, item, &path.index(i), index, pending)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Linked ids that neither the table nor the tree holds with the required fields
fn unresolved(
    store: &Store,
    linked: &Linked,
    reference: &ReferenceConfig,
    index: &TreeIndex,
) -> Vec<EntityId> {
    let required = &reference.required_fields;
    store.read(|table| {
        linked
            .ids()
            .into_iter()
            .filter(|id| {
                let in_table = table
                    .get(id.as_str())
                    .is_some_and(|record| record.has_fields(required));
                let in_tree = index
                    .get(id)
                    .is_some_and(|fields| required.iter().all(|f| fields.contains(f)));
                !in_table && !in_tree
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_foreign_key_parsing() {
        assert_eq!(Linked::from_foreign_key(&Value::Null), Some(Linked::None));
        assert_eq!(
            Linked::from_foreign_key(&Value::from("u1")),
            Some(Linked::One(EntityId::new("u1")))
        );
        assert_eq!(
            Linked::from_foreign_key(&Value::from(json!(["a", "b"]))),
            Some(Linked::Many(vec![EntityId::new("a"), EntityId::new("b")]))
        );
        assert_eq!(Linked::from_foreign_key(&Value::from(7)), None);
        assert_eq!(Linked::from_foreign_key(&Value::from(json!(["a", 1]))), None);
    }

    #[test]
    fn test_relation_ignores_tombstoned_elements() {
        let relation = Value::from(json!([
            {"id": "a", "typename": "T"},
            {"id": "b", "typename": "T", "__tombstone": "unlink"}
        ]));
        assert_eq!(
            Linked::from_relation(&relation),
            Some(Linked::Many(vec![EntityId::new("a")]))
        );
    }

    #[test]
    fn test_lists_agree_as_sets() {
        let a = Linked::Many(vec![EntityId::new("x"), EntityId::new("y")]);
        let b = Linked::Many(vec![EntityId::new("y"), EntityId::new("x")]);
        assert!(a.agrees_with(&b));
        assert!(!a.agrees_with(&Linked::One(EntityId::new("x"))));
    }

    #[test]
    fn test_foreign_key_from_relation() {
        assert_eq!(
            foreign_key_from_relation(&Value::reference("u1", "User")),
            Some(Value::from("u1"))
        );
        assert_eq!(
            foreign_key_from_relation(&Value::Array(vec![Value::reference("t1", "Tag")])),
            Some(Value::from(json!(["t1"])))
        );
        assert_eq!(foreign_key_from_relation(&Value::Null), Some(Value::Null));
        assert_eq!(foreign_key_from_relation(&Value::from(3)), None);
    }

    #[test]
    fn test_retain_nulls_dropped_scalar() {
        let mut linked = Linked::One(EntityId::new("gone"));
        linked.retain(|id| id.as_str() != "gone");
        assert_eq!(linked, Linked::None);
        assert_eq!(linked.to_relation("User"), Value::Null);
    }
}
