//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// compote - resolve, download and lock ESP-IDF component dependencies
#[derive(Parser)]
#[command(name = "compote")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve dependencies, fetch them into managed_components and write the lock
    Prepare(PrepareArgs),

    /// Manage the shared component cache
    Cache(CacheArgs),
}

#[derive(Args)]
pub struct PrepareArgs {
    /// Project directory
    #[arg(long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Project manifest (defaults to main/idf_component.yml)
    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    /// Chip target
    #[arg(long, env = "IDF_TARGET")]
    pub target: Option<String>,

    /// ESP-IDF version used to satisfy `idf` requirements
    #[arg(long, env = "IDF_VERSION")]
    pub idf_version: Option<String>,

    /// Lock file (defaults to dependencies.lock in the project directory)
    #[arg(long)]
    pub lock_path: Option<PathBuf>,

    /// JSON file with Kconfig values for `$CONFIG{..}` rules
    #[arg(long)]
    pub sdkconfig_json: Option<PathBuf>,

    /// Number of parallel downloads
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Print the cache directory
    Path,

    /// Delete everything in the cache
    Clear,
}
