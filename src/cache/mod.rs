//! Query cache layer
//!
//! Denormalized per-query snapshots kept current from the entity table, plus
//! the watchers that decide which store updates are relevant to them.

pub mod denormalize;
mod query_cache;
mod watch;
mod watcher;

pub use query_cache::QueryCache;
pub use watch::WatchTemplate;
pub use watcher::{
    decide, ObserverHandle, Observer, QueryWatcher, Reaction, Relevance, UnobservedPolicy,
    WatchOptions,
};
