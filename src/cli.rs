//! CLI argument parsing for blocksync

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// blocksync - In-Place Binary File Delta Synchronization
#[derive(Parser, Debug)]
#[command(name = "blocksync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute a block manifest for a file and write it as JSON
    Hash(HashArgs),

    /// Update a local file in place to match a remote file
    Sync(SyncArgs),
}

/// Arguments for the hash command
#[derive(Parser, Debug)]
pub struct HashArgs {
    /// File to hash
    pub input: PathBuf,

    /// Output manifest path (default: <input>.json)
    pub output: Option<PathBuf>,

    /// Block size in bytes (0 = pick from file size)
    #[arg(long, default_value = "0", value_parser = clap::value_parser!(u64).range(0..=64 * 1024 * 1024))]
    pub block_size: u64,

    /// Number of hashing threads (0 = one per CPU)
    #[arg(short = 'j', long, default_value = "0")]
    pub jobs: usize,

    /// Show a progress bar
    #[arg(short = 'P', long)]
    pub progress: bool,
}

/// Arguments for the sync command
#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Local file to update in place (created if missing)
    pub local: PathBuf,

    /// Remote file to match
    pub remote: PathBuf,

    /// Manifest path (default: <remote>.json)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Number of resolver threads (0 = one per CPU)
    #[arg(short = 'j', long, default_value = "0")]
    pub jobs: usize,

    /// Show progress bars
    #[arg(short = 'P', long)]
    pub progress: bool,
}

impl HashArgs {
    /// Resolved output path.
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| manifest_path_for(&self.input))
    }
}

impl SyncArgs {
    /// Resolved manifest path.
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest
            .clone()
            .unwrap_or_else(|| manifest_path_for(&self.remote))
    }
}

/// Sidecar manifest path: `<file>.json` next to the file.
fn manifest_path_for(path: &std::path::Path) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".json");
    path.with_file_name(name)
}
