//! Relevance templates
//!
//! A [`WatchTemplate`] lists the update events that can affect one snapshot:
//! deletion of any entity it shows, and a change to any field it selects.

use crate::graph::value::{ID_FIELD, TYPENAME_FIELD};
use crate::graph::{EntityId, Value};
use crate::store::{UpdateEvent, UpdateKind};
use std::collections::HashSet;

/// Events a snapshot depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchTemplate {
    deletes: HashSet<EntityId>,
    props: HashSet<(EntityId, String)>,
}

impl WatchTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every entity and selected field of a snapshot
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let mut template = Self::new();
        template.collect(snapshot);
        template
    }

    fn collect(&mut self, value: &Value) {
        match value {
            Value::Ref(reference) => {
                self.deletes.insert(reference.id.clone());
            }
            Value::Object(fields) => {
                if let Some(reference) = value.entity_ref() {
                    for key in fields.keys() {
                        if key != ID_FIELD && key != TYPENAME_FIELD {
                            self.props.insert((reference.id.clone(), key.clone()));
                        }
                    }
                    self.deletes.insert(reference.id);
                }
                fields.values().for_each(|child| self.collect(child));
            }
            Value::Array(items) => items.iter().for_each(|item| self.collect(item)),
            _ => {}
        }
    }

    pub fn watch_delete(&mut self, id: impl Into<EntityId>) {
        self.deletes.insert(id.into());
    }

    pub fn watch_prop(&mut self, id: impl Into<EntityId>, prop: impl Into<String>) {
        self.props.insert((id.into(), prop.into()));
    }

    /// Whether `event` can change the snapshot
    ///
    /// Creations never match: a new record is not part of any snapshot yet.
    pub fn matches(&self, event: &UpdateEvent) -> bool {
        match event.kind {
            UpdateKind::CreateEntity => false,
            UpdateKind::DeleteEntity => self.deletes.contains(event.id()),
            UpdateKind::UpdateProp => event.prop_name.as_ref().is_some_and(|prop| {
                self.props.contains(&(event.id().clone(), prop.clone()))
            }),
        }
    }

    pub fn matches_any(&self, events: &[UpdateEvent]) -> bool {
        events.iter().any(|event| self.matches(event))
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.props.is_empty()
    }

    /// Ids whose deletion is watched, sorted
    pub fn watched_ids(&self) -> Vec<&EntityId> {
        let mut ids: Vec<_> = self.deletes.iter().collect();
        ids.sort();
        ids
    }
}
