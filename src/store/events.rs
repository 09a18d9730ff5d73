//! Update events emitted by the store
//!
//! Events serialize to the wire shape
//! `{ "type": "UPDATE_PROP", "entity": { "id", "typename" }, "propName": "title" }`.

use crate::graph::{EntityId, Reference};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Kind of observed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    /// A record was added to the table
    CreateEntity,
    /// One field of an existing record changed
    UpdateProp,
    /// A record was removed from the table
    DeleteEntity,
}

/// One observed change to the entity table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "type")]
    pub kind: UpdateKind,

    /// The entity the change applies to
    pub entity: Reference,

    /// Changed field, for [`UpdateKind::UpdateProp`] only
    #[serde(
        rename = "propName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prop_name: Option<String>,
}

impl UpdateEvent {
    pub fn created(entity: Reference) -> Self {
        Self {
            kind: UpdateKind::CreateEntity,
            entity,
            prop_name: None,
        }
    }

    pub fn updated(entity: Reference, prop_name: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::UpdateProp,
            entity,
            prop_name: Some(prop_name.into()),
        }
    }

    pub fn deleted(entity: Reference) -> Self {
        Self {
            kind: UpdateKind::DeleteEntity,
            entity,
            prop_name: None,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.entity.id
    }
}

/// Drop repeated events, keeping the first occurrence of each (id, kind, prop)
pub fn dedup_events(events: Vec<UpdateEvent>) -> Vec<UpdateEvent> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(events.len());
    for event in events {
        let key = (
            event.entity.id.clone(),
            event.kind,
            event.prop_name.clone(),
        );
        if seen.insert(key) {
            unique.push(event);
        }
    }
    unique
}
