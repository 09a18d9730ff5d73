//! normcache - Normalized object cache for graph-shaped API responses
//!
//! Ingests denormalized response trees, keeps exactly one canonical record per
//! entity, and keeps per-query snapshots current as records change.
//!
//! # Architecture
//!
//! - **graph**: Value tree, references, records and paths
//! - **store**: Entity table, normalizer, link graph, association reconciler
//! - **cache**: Per-query snapshots, relevance templates, watchers
//! - **fetch**: Fetch policies over cached and fresh data
//! - **config**: Merge policies and associations loaded from YAML

// Core modules
pub mod config;
pub mod error;
pub mod graph;
pub mod logging;

// Components
pub mod cache;
pub mod fetch;
pub mod store;

// Re-exports
pub use error::{CacheError, Result};
