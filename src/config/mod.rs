//! Configuration system
//!
//! Loads ~/.config/normcache/config.yaml with support for:
//! - Default merge policies per array-of-entities field
//! - Foreign-key / relation associations per typename
//!
//! Missing-relation handlers and field transformers are code, not data; they
//! are registered on [`crate::store::StoreBuilder`].

mod store_config;
pub mod validation;

pub use store_config::{ReferenceConfig, StoreConfig, TypeConfig};
pub use validation::{validate_config, validate_config_result, ValidationError};
