//! CLI argument definitions for vizq.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog load` | Load datasets, annotation layers and charts into the warehouse |
//! | `cache-key` | Print the context key and every per-query key of a request |
//! | `chart-data` | Run a chart-data request through the cache |
//! | `context` | Rerun a request stored under a context cache key |
//! | `cache` | Inspect and invalidate cached entries |
//!
//! Requests are JSON documents read from a file, or from stdin when the path
//! is `-`.
//!
//! ```bash
//! vizq catalog load catalog.json
//! vizq chart-data request.json --cache-context --pretty
//! vizq cache invalidate 7__table
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "vizq",
    author,
    version,
    about = "Cached chart-data queries over a local DuckDB warehouse"
)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Warehouse home directory; defaults to $VIZQ_HOME or ~/.vizq.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Catalog management.
    Catalog(CatalogArgs),

    /// Print the whole-context cache key and the key of each query.
    CacheKey(RequestArgs),

    /// Run a chart-data request.
    ///
    /// Results come from the cache when a fresh entry exists; otherwise the
    /// dataset is queried and the result cached.
    ///
    ///   vizq chart-data request.json
    ///   vizq chart-data request.json --force
    ///   vizq chart-data request.json --force-cached
    ChartData(ChartDataArgs),

    /// Rerun a request stored with `chart-data --cache-context`.
    Context(ContextArgs),

    /// Cache management commands.
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
pub struct CatalogArgs {
    #[command(subcommand)]
    pub command: CatalogCommand,
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    /// Load a catalog JSON document. Entries with existing ids are replaced.
    Load {
        /// Catalog file, or `-` for stdin.
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct RequestArgs {
    /// Request file, or `-` for stdin.
    pub request: PathBuf,
}

#[derive(Debug, Args)]
pub struct ChartDataArgs {
    /// Request file, or `-` for stdin.
    pub request: PathBuf,

    /// Skip the cache read and query the dataset.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Answer from the cache only; a miss is an error.
    #[arg(long, default_value_t = false, conflicts_with = "force")]
    pub force_cached: bool,

    /// Store the request under its context key and print the key.
    #[arg(long, default_value_t = false)]
    pub cache_context: bool,
}

#[derive(Debug, Args)]
pub struct ContextArgs {
    /// Context key printed by `chart-data --cache-context`.
    pub cache_key: String,

    /// Answer from the cache only; a miss is an error.
    #[arg(long, default_value_t = false)]
    pub force_cached: bool,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show the live entry stored under a key.
    Get { key: String },

    /// Delete every entry written for a datasource uid such as `7__table`.
    Invalidate { datasource_uid: String },

    /// Delete cache entries.
    Purge {
        /// Delete only entries past their expiry.
        #[arg(long, default_value_t = false)]
        expired_only: bool,
    },
}

impl Command {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Catalog(_) => "catalog",
            Self::CacheKey(_) => "cache-key",
            Self::ChartData(_) => "chart-data",
            Self::Context(_) => "context",
            Self::Cache(_) => "cache",
        }
    }
}
