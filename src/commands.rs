//! CLI command definitions
//!
//! All CLI structs and subcommand enums are defined here.

use clap::{Parser, Subcommand};
use normcache::fetch::FetchPolicy;
use std::path::PathBuf;

/// normcache - Normalized object cache for graph-shaped API responses
#[derive(Parser, Debug)]
#[command(name = "normcache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.config/normcache/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store JSON payloads in order, printing each update batch as a JSON line
    Ingest {
        /// Payload files; a file listed twice is one query fetched twice
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Fetch policy applied to each file
        #[arg(short, long, default_value = "cache-first")]
        policy: FetchPolicy,

        /// Run the invariant checkers after the last file
        #[arg(long)]
        check: bool,
    },

    /// Store JSON payloads and report invariant violations only
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Validate a config file (default: --config or the default path)
    ValidateConfig {
        path: Option<String>,
    },
}
