//! SnapFS Command Line Interface
//!
//! Unified CLI tool for managing SnapFS filesystem images.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;

use snapfs::FsConfig;

mod commands;

/// SnapFS - journaled filesystem with copy-on-write snapshots
#[derive(Parser)]
#[command(
    name = "snapfs",
    about = "SnapFS command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "SnapFS Contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// JSON file with mount-time configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format an image file or device with SnapFS
    Format(commands::format::FormatArgs),

    /// Manage snapshots
    Snapshot(commands::snapshot::SnapshotArgs),

    /// Check block reference counts and allocation
    Scrub(commands::scrub::ScrubArgs),

    /// Read and modify files inside an image
    File(commands::files::FileArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("SnapFS CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => FsConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FsConfig::default(),
    };

    match cli.command {
        Commands::Format(args) => commands::format::run(args, config).await,
        Commands::Snapshot(args) => commands::snapshot::run(args, config).await,
        Commands::Scrub(args) => commands::scrub::run(args, config).await,
        Commands::File(args) => commands::files::run(args, config).await,
    }
}
