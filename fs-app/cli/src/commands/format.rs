//! Format command for creating SnapFS filesystems

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use snapfs::format::DEFAULT_JOURNAL_BLOCKS;
use snapfs::{BlockDevice, FileBackedBlockDevice, FormatOptions, FsConfig, Vfs, BLOCK_SIZE};

use super::{confirm, finish, format_bytes};

/// Format an image file or device with SnapFS
#[derive(Parser, Debug)]
#[command(about = "Format an image file or device with SnapFS")]
pub struct FormatArgs {
    /// Image file or device to format
    pub image: PathBuf,

    /// Image size in MiB; ignored for existing block devices
    #[arg(short, long, default_value_t = 64)]
    pub size: u64,

    /// Number of inode slots (default: one per four blocks)
    #[arg(short, long)]
    pub inodes: Option<u64>,

    /// Journal size in blocks
    #[arg(short, long, default_value_t = DEFAULT_JOURNAL_BLOCKS)]
    pub journal_blocks: u64,

    /// Volume label
    #[arg(short = 'L', long)]
    pub label: Option<String>,

    /// Force formatting without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(args: FormatArgs, config: FsConfig) -> Result<()> {
    info!("SnapFS Format Tool v{}", env!("CARGO_PKG_VERSION"));

    let exists = args.image.exists();
    if exists && !args.force {
        println!(
            "WARNING: This will format {} as a SnapFS filesystem.",
            args.image.display()
        );
        println!("This operation will DESTROY ALL DATA on it!");
        if !confirm("Are you sure you want to continue? [y/N]", "y")? {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    let device = if exists && !args.image.is_file() {
        info!("Detected block device: {}", args.image.display());
        FileBackedBlockDevice::open(&args.image, false)
            .await
            .with_context(|| format!("Failed to open device: {}", args.image.display()))?
    } else {
        let bytes = args
            .size
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("Requested size is too large"))?;
        info!("Creating image {} ({})", args.image.display(), format_bytes(bytes));
        FileBackedBlockDevice::create(&args.image, bytes)
            .await
            .with_context(|| format!("Failed to create image: {}", args.image.display()))?
    };
    if device.is_read_only() {
        return Err(anyhow!("{} is read-only", args.image.display()));
    }

    let options = FormatOptions {
        inode_count: args.inodes,
        journal_blocks: args.journal_blocks,
        volume_name: args.label.clone(),
    };
    let vfs = Vfs::format(Arc::new(device), &options, config)
        .await
        .with_context(|| format!("Failed to format device: {}", args.image.display()))?;

    let layout = *vfs.fs().layout();
    println!("Formatted {} as SnapFS", args.image.display());
    println!(
        "  Blocks:      {} x {} bytes ({})",
        layout.block_count,
        BLOCK_SIZE,
        format_bytes(layout.block_count * BLOCK_SIZE as u64)
    );
    println!("  Inodes:      {}", layout.inode_count);
    println!("  Journal:     {} blocks", layout.journal_blocks);
    println!("  Data blocks: {}", layout.data_blocks_count);

    finish(vfs, Ok(())).await
}
