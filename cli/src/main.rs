//! The jam command line.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod integrity;
mod keys;
mod read;
mod snaps;
mod sync;
mod system;
mod write;

#[derive(Parser)]
#[command(name = "jam", about = "immutable, encrypted, deduplicated snapshots")]
struct Cli {
    #[command(flatten)]
    sys: system::SysOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add the given source directory to a new snapshot, forked from
    /// the latest snapshot.
    Store {
        source: PathBuf,
        /// prefix to store the source under
        target_prefix: Option<String>,
    },
    /// List files in the given snapshot.
    Ls {
        /// which snapshot to use ("latest" or a unix-nanosecond id)
        #[arg(long, default_value = "latest")]
        snap: String,
        /// list recursively
        #[arg(short, long)]
        recursive: bool,
        prefix: Option<String>,
    },
    /// List snapshots.
    Snaps,
    /// Remove an old snapshot.
    Unsnap {
        /// unix-nanosecond snapshot id
        snap: String,
    },
    /// Make a new snapshot that matches an older one.
    RevertTo {
        /// unix-nanosecond snapshot id
        snap: String,
    },
    /// Regexp-based search and replace against all paths, forked from
    /// the latest snapshot.
    Rename {
        pattern: String,
        replacement: String,
    },
    /// Delete all paths matching the provided regexp.
    Rm { pattern: String },
    /// Consistency check of blobs, hashes, and a snapshot's paths. For
    /// full effect, disable caching and enable read comparison.
    Integrity {
        /// which snapshot to use
        #[arg(long, default_value = "latest")]
        snap: String,
        /// show blobs no hash references
        #[arg(long)]
        show_unneeded: bool,
        /// skip reading the known end of each blob
        #[arg(long)]
        skip_blob_end: bool,
    },
    /// Rewrite all hashsets as one (defragmentation).
    CoalesceHashes,
    /// Regroup hashsets by the blob their streams end in.
    SplitHashes,
    /// Encryption key utilities.
    #[command(subcommand)]
    Key(keys::KeyCommand),
    /// Copy objects missing from one backend to another.
    BackendSync { source: String, dest: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Store {
            source,
            target_prefix,
        } => write::store(&cli.sys, &source, target_prefix.as_deref().unwrap_or("")).await,
        Command::Ls {
            snap,
            recursive,
            prefix,
        } => read::ls(&cli.sys, &snap, recursive, prefix.as_deref().unwrap_or("")).await,
        Command::Snaps => snaps::list(&cli.sys).await,
        Command::Unsnap { snap } => snaps::unsnap(&cli.sys, &snap).await,
        Command::RevertTo { snap } => snaps::revert_to(&cli.sys, &snap).await,
        Command::Rename {
            pattern,
            replacement,
        } => write::rename(&cli.sys, &pattern, &replacement).await,
        Command::Rm { pattern } => write::rm(&cli.sys, &pattern).await,
        Command::Integrity {
            snap,
            show_unneeded,
            skip_blob_end,
        } => integrity::check(&cli.sys, &snap, show_unneeded, skip_blob_end).await,
        Command::CoalesceHashes => snaps::coalesce_hashes(&cli.sys).await,
        Command::SplitHashes => snaps::split_hashes(&cli.sys).await,
        Command::Key(cmd) => keys::run(cmd),
        Command::BackendSync { source, dest } => sync::backend_sync(&source, &dest).await,
    }
}
