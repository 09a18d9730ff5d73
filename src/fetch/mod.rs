//! Fetching queries
//!
//! [`fetch_by_policy`] decides between a query's cached snapshot and a fresh
//! fetch. [`StoredQuery`] is the standard [`FetchSource`]: it stores fetched
//! payloads in a [`crate::store::Store`] and seeds its snapshot cache from the
//! result.

mod policy;
mod query;

pub use policy::{fetch_by_policy, FetchOutcome, FetchPolicy, FetchSource};
pub use query::{FileFetcher, Fetcher, StoredQuery};
