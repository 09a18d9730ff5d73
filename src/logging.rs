//! Logging setup for the `normcache` binary and tests
//!
//! The library only emits events; installing a subscriber is left to the
//! embedding application. Targets worth filtering on:
//!
//! - `normcache::store`: one `debug` line per `store()` call with the number
//!   of updates, `trace` per merged record and per merged array
//! - `normcache::store::links`: cascaded deletes at `debug`, each pruned
//!   reference at `trace`
//! - `normcache::store::associations`: handler calls at `debug`, ids dropped
//!   because they stayed unresolved or vanished during a handler at `warn`
//! - `normcache::cache`: watcher pause/resume at `debug`, the reaction to
//!   each update batch at `trace`
//! - `normcache::fetch`: which policy served a query from cache

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr subscriber, filtered by RUST_LOG or `warn`
///
/// `RUST_LOG=normcache::store::associations=warn,normcache::cache=debug` is a
/// useful setting when tracking down why a watcher did or did not fire.
///
/// # Errors
/// Returns an error if a global subscriber is already installed
pub fn init() -> crate::Result<()> {
    init_with_default("warn")
}

/// Initialize with a fallback filter used when RUST_LOG is unset
pub fn init_with_default(default_filter: &str) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .pretty(),
        )
        .try_init()
        .map_err(|e| crate::CacheError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
