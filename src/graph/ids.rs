//! Type-safe identifiers for entities and their references

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Type-safe wrapper for entity IDs
///
/// Prevents mixing up entity IDs with typenames or field names at compile time.
/// IDs are opaque strings assigned by the server (e.g., "person1", "article1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new EntityId from a string
    ///
    /// # Arguments
    /// * `id` - The entity ID string (e.g., "person1")
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&EntityId> for EntityId {
    fn from(id: &EntityId) -> Self {
        id.clone()
    }
}

/// A by-reference pointer to a record in the entity table
///
/// A reference never stores data of its own. Dereferencing is always an
/// explicit table lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// ID of the referenced record
    pub id: EntityId,

    /// Typename of the referenced record
    pub typename: String,
}

impl Reference {
    /// Create a new reference
    pub fn new(id: impl Into<EntityId>, typename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            typename: typename.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}
