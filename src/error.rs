//! Error types for normcache
//!
//! Defines the error enum covering every failure mode of the store, the
//! association layer, the invariant checkers, and configuration handling.
//! Uses thiserror for ergonomic error handling.

use crate::graph::EntityId;
use crate::store::checks::{InvalidReference, MissingLink};
use thiserror::Error;

/// Result type alias for normcache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for normcache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// An object carries `id` without `typename` or vice versa
    #[error("object at {path} has `{present}` but not both id and typename")]
    PartialIdentity { path: String, present: &'static str },

    /// An array of entities was ingested without a merge policy
    #[error("no or invalid merge policy for field {field} on {typename}")]
    NoMergePolicy { typename: String, field: String },

    /// Relation and foreign key were both supplied and disagree
    #[error("association mismatch on {id}: {relation_field} does not match {foreign_key}")]
    AssociationMismatch {
        id: EntityId,
        relation_field: String,
        foreign_key: String,
    },

    /// A related entity is missing and no handler can fetch it
    #[error("entity {id} ({typename}) is missing and no missing-relation handler is configured")]
    MissingEntity { id: EntityId, typename: String },

    /// A foreign-key field holds something other than an id, list of ids, or null
    #[error("invalid foreign key {field} on {id}: expected id, list of ids, or null")]
    InvalidForeignKey { id: EntityId, field: String },

    /// The table contains references to records that do not exist
    #[error("{} dangling reference(s) in the entity table", .0.len())]
    DanglingReferences(Vec<MissingLink>),

    /// Foreign-key and relation fields disagree somewhere in the table
    #[error("{} foreign key / relation pair(s) disagree", .0.len())]
    InvalidReferences(Vec<InvalidReference>),

    /// Cache-only fetch requested with nothing cached
    #[error("no cached data available for cache-only fetch")]
    NotCached,

    /// A missing-relation handler or fetch source failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (from user-supplied handlers)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl CacheError {
    /// Whether this failure aborts a `store()` call as a contract violation
    ///
    /// Contract violations come from malformed input or configuration and will
    /// fail again on retry.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            CacheError::PartialIdentity { .. }
                | CacheError::NoMergePolicy { .. }
                | CacheError::AssociationMismatch { .. }
                | CacheError::MissingEntity { .. }
                | CacheError::InvalidForeignKey { .. }
        )
    }
}
