//! normcache - Normalized object cache
//!
//! Main entry point for the normcache CLI.

mod commands;

use clap::Parser;
use commands::{Cli, Commands};
use normcache::config::{validate_config, validate_config_result, StoreConfig};
use normcache::fetch::{fetch_by_policy, FetchPolicy, FileFetcher, StoredQuery};
use normcache::store::{checks, Store, Subscription};
use normcache::CacheError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose { "normcache=debug" } else { "warn" };
    if let Err(e) = normcache::logging::init_with_default(default_filter) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> normcache::Result<()> {
    match cli.command {
        Commands::ValidateConfig { path } => handle_validate_config(path.or(cli.config)),
        Commands::Ingest {
            files,
            policy,
            check,
        } => {
            let store = Store::new(load_config(cli.config.as_deref())?);
            let _printer = print_updates(&store);
            ingest(&store, &files, policy).await?;
            if check {
                report_checks(&store)?;
            }
            Ok(())
        }
        Commands::Check { files } => {
            let store = Store::new(load_config(cli.config.as_deref())?);
            ingest(&store, &files, FetchPolicy::NetworkOnly).await?;
            report_checks(&store)
        }
    }
}

/// Load the given config, or the default one when it exists
fn load_config(path: Option<&str>) -> normcache::Result<StoreConfig> {
    let config = match path {
        Some(path) => StoreConfig::load(path)?,
        None if StoreConfig::default_path().exists() => StoreConfig::load_default()?,
        None => {
            info!("No config file found, using empty configuration");
            StoreConfig::new()
        }
    };
    validate_config_result(&config)?;
    Ok(config)
}

fn print_updates(store: &Store) -> Subscription {
    store.subscribe(|updates| match serde_json::to_string(updates) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize update batch"),
    })
}

/// Fetch each file through its own query; repeated paths share one query
async fn ingest(store: &Store, files: &[PathBuf], policy: FetchPolicy) -> normcache::Result<()> {
    let mut queries: HashMap<&Path, StoredQuery<FileFetcher>> = HashMap::new();

    for file in files {
        let query = &*queries.entry(file.as_path()).or_insert_with(|| {
            StoredQuery::new(store.clone(), FileFetcher::new(file)).with_policy(policy)
        });
        let outcome = fetch_by_policy(query, query.policy()).await?;
        info!(
            file = %file.display(),
            served_from_cache = outcome.served_from_cache,
            fetched = outcome.fetched.is_some(),
            "Ingested payload"
        );
    }

    eprintln!("Stored {} file(s); {} record(s) in table", files.len(), store.len());
    Ok(())
}

fn report_checks(store: &Store) -> normcache::Result<()> {
    let (missing, invalid) = store.read(|table| {
        (
            checks::missing_links(table),
            checks::invalid_references(table, store.config()),
        )
    });

    for link in &missing {
        println!("dangling reference: {}", link);
    }
    for reference in &invalid {
        println!("invalid reference: {}", reference);
    }

    if !missing.is_empty() {
        return Err(CacheError::DanglingReferences(missing));
    }
    if !invalid.is_empty() {
        return Err(CacheError::InvalidReferences(invalid));
    }
    println!("✓ No invariant violations");
    Ok(())
}

fn handle_validate_config(path: Option<String>) -> normcache::Result<()> {
    let path = path
        .map(PathBuf::from)
        .unwrap_or_else(StoreConfig::default_path);
    let config = StoreConfig::load(&path)?;

    let Err(errors) = validate_config(&config) else {
        println!("✓ Config is valid: {}", path.display());
        println!("  {} type(s) configured", config.types.len());
        return Ok(());
    };

    for error in &errors {
        println!("  ✗ {}", error);
    }
    Err(CacheError::Config(format!(
        "{} validation error(s) in {}",
        errors.len(),
        path.display()
    )))
}
