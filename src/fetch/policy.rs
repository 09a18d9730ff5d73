//! Fetch policies
//!
//! Decide whether a query is served from its cached snapshot, from the
//! network, or both.

use crate::graph::Value;
use crate::{CacheError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// How a query combines its cached snapshot with a network fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve the cache when present, otherwise fetch
    #[default]
    CacheFirst,
    /// Serve the cache or fail
    CacheOnly,
    /// Serve the cache when present and always fetch
    CacheAndNetwork,
    /// Always fetch
    NetworkOnly,
}

impl FetchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::CacheOnly => "cache-only",
            Self::CacheAndNetwork => "cache-and-network",
            Self::NetworkOnly => "network-only",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FetchPolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "cache-first" => Ok(Self::CacheFirst),
            "cache-only" => Ok(Self::CacheOnly),
            "cache-and-network" => Ok(Self::CacheAndNetwork),
            "network-only" => Ok(Self::NetworkOnly),
            _ => Err(CacheError::Config(format!(
                "Invalid fetch policy '{}'. Use cache-first, cache-only, cache-and-network, or network-only",
                s
            ))),
        }
    }
}

/// A query that can be served from cache or fetched
#[async_trait]
pub trait FetchSource: Send + Sync {
    /// Whether a snapshot is cached
    fn is_cached(&self) -> bool;

    /// Fetch fresh data
    async fn fetch_data(&self) -> Result<Value>;

    /// Ingest fetched data; returns the denormalized result
    async fn cache_data(&self, data: Value) -> Result<Value>;
}

/// What [`fetch_by_policy`] did
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// The cached snapshot satisfied the request
    pub served_from_cache: bool,

    /// Denormalized result of a network fetch, when one happened
    pub fetched: Option<Value>,
}

/// Run `source` according to `policy`
///
/// # Errors
/// [`CacheError::NotCached`] for [`FetchPolicy::CacheOnly`] with nothing
/// cached; otherwise whatever fetching or caching returns.
pub async fn fetch_by_policy<S>(source: &S, policy: FetchPolicy) -> Result<FetchOutcome>
where
    S: FetchSource + ?Sized,
{
    let cached = source.is_cached();
    debug!(%policy, cached, "Resolving fetch policy");

    let fetch = match policy {
        FetchPolicy::CacheFirst => !cached,
        FetchPolicy::CacheOnly if !cached => return Err(CacheError::NotCached),
        FetchPolicy::CacheOnly => false,
        FetchPolicy::CacheAndNetwork | FetchPolicy::NetworkOnly => true,
    };
    let served_from_cache = cached && policy != FetchPolicy::NetworkOnly;

    let fetched = if fetch {
        let data = source.fetch_data().await?;
        Some(source.cache_data(data).await?)
    } else {
        None
    };

    Ok(FetchOutcome {
        served_from_cache,
        fetched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counting {
        cached: AtomicBool,
        fetches: AtomicUsize,
    }

    impl Counting {
        fn new(cached: bool) -> Self {
            Self {
                cached: AtomicBool::new(cached),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FetchSource for Counting {
        fn is_cached(&self) -> bool {
            self.cached.load(Ordering::SeqCst)
        }

        async fn fetch_data(&self) -> Result<Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from("fresh"))
        }

        async fn cache_data(&self, data: Value) -> Result<Value> {
            self.cached.store(true, Ordering::SeqCst);
            Ok(data)
        }
    }

    #[tokio::test]
    async fn test_cache_first() {
        let source = Counting::new(false);
        let outcome = fetch_by_policy(&source, FetchPolicy::CacheFirst).await.unwrap();
        assert!(!outcome.served_from_cache);
        assert_eq!(outcome.fetched, Some(Value::from("fresh")));

        let outcome = fetch_by_policy(&source, FetchPolicy::CacheFirst).await.unwrap();
        assert!(outcome.served_from_cache);
        assert!(outcome.fetched.is_none());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_only_without_cache_fails() {
        let source = Counting::new(false);
        let err = fetch_by_policy(&source, FetchPolicy::CacheOnly).await.unwrap_err();
        assert!(matches!(err, CacheError::NotCached));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_and_network_serves_and_fetches() {
        let source = Counting::new(true);
        let outcome = fetch_by_policy(&source, FetchPolicy::CacheAndNetwork).await.unwrap();
        assert!(outcome.served_from_cache);
        assert!(outcome.fetched.is_some());
    }

    #[tokio::test]
    async fn test_network_only_ignores_cache() {
        let source = Counting::new(true);
        let outcome = fetch_by_policy(&source, FetchPolicy::NetworkOnly).await.unwrap();
        assert!(!outcome.served_from_cache);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("cache_and_network".parse::<FetchPolicy>().unwrap(), FetchPolicy::CacheAndNetwork);
        assert_eq!("Network-Only".parse::<FetchPolicy>().unwrap(), FetchPolicy::NetworkOnly);
        assert!("sometimes".parse::<FetchPolicy>().is_err());
        assert_eq!(FetchPolicy::default().to_string(), "cache-first");
    }
}
