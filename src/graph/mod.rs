//! Core value model
//!
//! Defines the tagged [`Value`] tree, entity identifiers, references,
//! canonical records, and paths into value trees.

mod ids;
mod path;
mod record;
pub mod value;

pub use ids::{EntityId, Reference};
pub use path::{Path, PathSegment};
pub use record::Record;
pub use value::{Fields, Identity, Tombstone, Value};
