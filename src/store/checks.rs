//! Table invariant checkers
//!
//! Diagnostics run on demand against a snapshot of the table. Neither check
//! mutates anything.

use super::associations::Linked;
use super::table::EntityTable;
use crate::config::StoreConfig;
use crate::graph::EntityId;
use crate::{CacheError, Result};
use serde::Serialize;
use std::fmt;

/// A reference to a record that is not in the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingLink {
    /// Record holding the reference
    pub holder: EntityId,
    /// Top-level field the reference lives under
    pub field: String,
    /// Id that could not be found
    pub missing: EntityId,
}

impl fmt::Display for MissingLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.holder, self.field, self.missing)
    }
}

/// A foreign key that disagrees with its relation field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidReference {
    pub id: EntityId,
    pub foreign_key: String,
    pub relation_field: String,
    pub reason: String,
}

impl fmt::Display for InvalidReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} / {}: {}",
            self.id, self.foreign_key, self.relation_field, self.reason
        )
    }
}

/// Every reference whose target record is absent, sorted by holder
pub fn missing_links(table: &EntityTable) -> Vec<MissingLink> {
    let mut missing = Vec::new();
    for record in table.records() {
        for (field, value) in &record.fields {
            value.for_each_ref(&mut |reference| {
                if !table.contains(reference.id.as_str()) {
                    missing.push(MissingLink {
                        holder: record.id.clone(),
                        field: field.clone(),
                        missing: reference.id.clone(),
                    });
                }
            });
        }
    }
    missing.sort_by(|a, b| (&a.holder, &a.field).cmp(&(&b.holder, &b.field)));
    missing
}

pub fn check_missing_links(table: &EntityTable) -> Result<()> {
    let missing = missing_links(table);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CacheError::DanglingReferences(missing))
    }
}

/// Every association whose foreign key and relation both exist and disagree
pub fn invalid_references(table: &EntityTable, config: &StoreConfig) -> Vec<InvalidReference> {
    let mut invalid = Vec::new();
    for record in table.records() {
        for (foreign_key, reference) in config.references(&record.typename) {
            let (Some(key_value), Some(relation)) =
                (record.get(foreign_key), record.get(&reference.field))
            else {
                continue;
            };

            let reason = match (
                Linked::from_foreign_key(key_value),
                Linked::from_relation(relation),
            ) {
                (None, _) => Some("foreign key is not an id, list of ids, or null".to_string()),
                (_, None) => Some("relation is not a reference, list, or null".to_string()),
                (Some(key), Some(related)) if !key.agrees_with(&related) => {
                    Some(format!("expected {:?}, relation holds {:?}", key, related))
                }
                _ => None,
            };

            if let Some(reason) = reason {
                invalid.push(InvalidReference {
                    id: record.id.clone(),
                    foreign_key: foreign_key.to_string(),
                    relation_field: reference.field.clone(),
                    reason,
                });
            }
        }
    }
    invalid.sort_by(|a, b| (&a.id, &a.foreign_key).cmp(&(&b.id, &b.foreign_key)));
    invalid
}

pub fn check_invalid_references(table: &EntityTable, config: &StoreConfig) -> Result<()> {
    let invalid = invalid_references(table, config);
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(CacheError::InvalidReferences(invalid))
    }
}
