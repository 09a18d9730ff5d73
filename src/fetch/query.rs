//! A fetchable query bound to a store and its snapshot cache

use super::{FetchPolicy, FetchSource};
use crate::cache::QueryCache;
use crate::graph::Value;
use crate::store::{Store, StoreCallbacks};
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Produces a fresh denormalized payload for one query
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Value>;
}

/// Reads a JSON payload from disk on every fetch
#[derive(Debug, Clone)]
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self) -> Result<Value> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let json: serde_json::Value = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), "Fetched payload from file");
        Ok(Value::from(json))
    }
}

/// One query: a fetcher, the callbacks used to store its results, and the
/// cached snapshot of the last result
pub struct StoredQuery<F> {
    store: Store,
    callbacks: StoreCallbacks,
    cache: Mutex<QueryCache>,
    fetcher: F,
    policy: FetchPolicy,
}

impl<F: Fetcher> StoredQuery<F> {
    pub fn new(store: Store, fetcher: F) -> Self {
        Self {
            cache: Mutex::new(QueryCache::new(store.clone())),
            store,
            callbacks: StoreCallbacks::new(),
            fetcher,
            policy: FetchPolicy::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: StoreCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FetchPolicy {
        self.policy
    }

    /// Current result, re-derived from the table unless just fetched
    pub fn current(&self) -> Option<Arc<Value>> {
        self.lock().resolve()
    }

    /// Copy of the snapshot cache, e.g. to hand to a watcher
    pub fn cache(&self) -> QueryCache {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, QueryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<F: Fetcher> FetchSource for StoredQuery<F> {
    fn is_cached(&self) -> bool {
        self.lock().is_cached()
    }

    async fn fetch_data(&self) -> Result<Value> {
        self.fetcher.fetch().await
    }

    async fn cache_data(&self, data: Value) -> Result<Value> {
        let outcome = self.store.store(data, &self.callbacks).await?;
        let snapshot = self.lock().seed(outcome);
        Ok(Value::clone(&snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fetch_by_policy;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_file_query_caches_after_first_fetch() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            json!({"me": {"id": "u1", "typename": "User", "name": "Ada"}})
        )
        .unwrap();

        let store = Store::default();
        let query = StoredQuery::new(store.clone(), FileFetcher::new(file.path()));
        assert!(!query.is_cached());

        let first = fetch_by_policy(&query, query.policy()).await.unwrap();
        assert!(first.fetched.is_some());
        assert!(store.contains("u1"));

        let second = fetch_by_policy(&query, FetchPolicy::CacheFirst).await.unwrap();
        assert!(second.served_from_cache);
        assert_eq!(
            query.current().unwrap().get("me").and_then(|m| m.get("name")),
            Some(&Value::from("Ada"))
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let query = StoredQuery::new(Store::default(), FileFetcher::new("/nonexistent/payload.json"));
        let err = fetch_by_policy(&query, FetchPolicy::NetworkOnly).await.unwrap_err();
        assert!(matches!(err, crate::CacheError::Io(_)));
    }
}
