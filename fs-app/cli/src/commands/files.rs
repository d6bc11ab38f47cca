//! File commands for inspecting and editing the tree inside an image

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;

use snapfs::{FsConfig, InodeKind, Vfs};

use super::{finish, format_time, open_vfs};

/// Read and modify files inside an image
#[derive(Parser)]
#[command(about = "Read and modify files inside a SnapFS image")]
pub struct FileArgs {
    /// Image or device to operate on
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: FileCommands,
}

#[derive(Subcommand)]
pub enum FileCommands {
    /// Write a file, replacing its contents
    Put {
        /// Destination path inside the image
        path: String,

        /// Local file to copy from (default: stdin)
        #[arg(short, long)]
        from: Option<PathBuf>,
    },

    /// Print a file
    Cat {
        /// Path inside the image
        path: String,
    },

    /// List a directory
    Ls {
        /// Directory inside the image
        #[arg(default_value = "/")]
        path: String,
    },

    /// Create a directory
    Mkdir {
        /// Path inside the image
        path: String,
    },

    /// Create a device node
    Mknod {
        /// Path inside the image
        path: String,
        /// Major device number
        major: u16,
        /// Minor device number
        minor: u16,
    },

    /// Remove a file or empty directory
    Rm {
        /// Path inside the image
        path: String,
    },

    /// Create a hard link
    Ln {
        /// Existing file
        old: String,
        /// New name
        new: String,
    },

    /// Show inode attributes
    Stat {
        /// Path inside the image
        path: String,
    },

    /// Show where each block of a file lives and how often it is shared
    Addrs {
        /// Path inside the image
        path: String,
    },
}

pub async fn run(args: FileArgs, config: FsConfig) -> Result<()> {
    let vfs = open_vfs(&args.image, config).await?;
    let result = execute(&vfs, args.command).await;
    finish(vfs, result).await
}

fn kind_char(kind: Option<InodeKind>) -> char {
    match kind {
        Some(InodeKind::Directory) => 'd',
        Some(InodeKind::Device) => 'c',
        Some(InodeKind::File) => '-',
        _ => '?',
    }
}

async fn execute(vfs: &Vfs, command: FileCommands) -> Result<()> {
    match command {
        FileCommands::Put { path, from } => {
            let data = match from {
                Some(local) => tokio::fs::read(&local)
                    .await
                    .with_context(|| format!("Failed to read {}", local.display()))?,
                None => {
                    let mut data = Vec::new();
                    std::io::stdin().read_to_end(&mut data)?;
                    data
                }
            };
            vfs.write_file(&path, &data)
                .await
                .with_context(|| format!("Failed to write {}", path))?;
            println!("Wrote {} bytes to {}", data.len(), path);
        }

        FileCommands::Cat { path } => {
            let data = vfs
                .read_file(&path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            std::io::stdout().write_all(&data)?;
        }

        FileCommands::Ls { path } => {
            let mut entries = vfs
                .read_dir(&path)
                .await
                .with_context(|| format!("Failed to list {}", path))?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in entries {
                let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
                let size = match vfs.stat(&child).await {
                    Ok(stat) => stat.size.to_string(),
                    Err(_) => "?".to_string(),
                };
                println!(
                    "{} {:>6} {:>10} {}",
                    kind_char(entry.kind),
                    entry.inode,
                    size,
                    entry.name
                );
            }
        }

        FileCommands::Mkdir { path } => {
            vfs.mkdir(&path)
                .await
                .with_context(|| format!("Failed to create directory {}", path))?;
        }

        FileCommands::Mknod { path, major, minor } => {
            vfs.mknod(&path, major, minor)
                .await
                .with_context(|| format!("Failed to create device {}", path))?;
        }

        FileCommands::Rm { path } => {
            vfs.unlink(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path))?;
        }

        FileCommands::Ln { old, new } => {
            vfs.link(&old, &new)
                .await
                .with_context(|| format!("Failed to link {} to {}", new, old))?;
        }

        FileCommands::Stat { path } => {
            let stat = vfs
                .stat(&path)
                .await
                .with_context(|| format!("Failed to stat {}", path))?;
            println!("  File:     {}", path);
            println!("  Inode:    {}", stat.inode);
            println!("  Type:     {}", stat.kind.as_str());
            println!("  Links:    {}", stat.links);
            println!("  Size:     {}", stat.size);
            println!("  Perm:     {:o}", stat.perm);
            if stat.kind == InodeKind::Device {
                println!("  Device:   {},{}", stat.major, stat.minor);
            }
            println!("  Created:  {}", format_time(stat.ctime));
            println!("  Modified: {}", format_time(stat.mtime));
        }

        FileCommands::Addrs { path } => {
            let mappings = vfs
                .block_addrs(&path)
                .await
                .with_context(|| format!("Failed to map {}", path))?;
            println!("{:<10} {:<10} {:<6}", "LOGICAL", "PHYSICAL", "REFS");
            for m in mappings {
                let logical = match m.logical {
                    Some(bn) => bn.to_string(),
                    None => "indirect".to_string(),
                };
                println!("{:<10} {:<10} {:<6}", logical, m.physical, m.refs);
            }
        }
    }

    Ok(())
}
