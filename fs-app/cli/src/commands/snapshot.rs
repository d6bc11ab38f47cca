//! Snapshot command for managing SnapFS snapshots

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use snapfs::{FsConfig, Vfs, BLOCK_SIZE};

use super::{confirm, finish, format_bytes, format_time, open_vfs};

/// Manage snapshots
#[derive(Parser)]
#[command(about = "Manage SnapFS snapshots")]
pub struct SnapshotArgs {
    /// Image or device to operate on
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: SnapshotCommands,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Snapshot the live tree
    Create,

    /// List all snapshots
    List {
        /// Show detailed information
        #[arg(short, long)]
        long: bool,

        /// Print JSON
        #[arg(long, conflicts_with = "long")]
        json: bool,
    },

    /// Delete a snapshot
    Delete {
        /// ID of the snapshot to delete
        id: u32,
    },

    /// Rollback to a snapshot
    Rollback {
        /// ID of the snapshot to rollback to
        id: u32,

        /// Force rollback without confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Show snapshot statistics
    Stats,
}

pub async fn run(args: SnapshotArgs, config: FsConfig) -> Result<()> {
    let vfs = open_vfs(&args.image, config).await?;
    let result = execute(&vfs, args.command).await;
    finish(vfs, result).await
}

async fn execute(vfs: &Vfs, command: SnapshotCommands) -> Result<()> {
    match command {
        SnapshotCommands::Create => {
            info!("Creating snapshot");
            let id = vfs
                .snapshot_create()
                .await
                .context("Failed to create snapshot")?;
            println!("Created snapshot {:02}", id);
        }

        SnapshotCommands::List { long, json } => {
            let snapshots = vfs.list_snapshots().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
                return Ok(());
            }
            if snapshots.is_empty() {
                println!("No snapshots found");
                return Ok(());
            }

            if long {
                println!("{:<6} {:<20} {:<22} {:<10}", "ID", "PATH", "CREATED", "ROOT");
                println!("{}", "-".repeat(60));
                for snap in snapshots {
                    println!(
                        "{:<6} {:<20} {:<22} {:<10}",
                        format!("{:02}", snap.id),
                        snap.path,
                        format_time(snap.created_at),
                        snap.root_inode
                    );
                }
            } else {
                println!("Snapshots:");
                for snap in snapshots {
                    println!("  {:02} - {}", snap.id, snap.path);
                }
            }
        }

        SnapshotCommands::Delete { id } => {
            info!("Deleting snapshot ID {}", id);
            vfs.snapshot_delete(id)
                .await
                .with_context(|| format!("Failed to delete snapshot {:02}", id))?;
            println!("Deleted snapshot {:02}", id);
        }

        SnapshotCommands::Rollback { id, force } => {
            if !force {
                println!("WARNING: Rolling back to a snapshot will discard all changes made after the snapshot was created.");
                if !confirm(
                    &format!("Are you sure you want to rollback to snapshot {:02}? (yes/no)", id),
                    "yes",
                )? {
                    println!("Rollback cancelled");
                    return Ok(());
                }
            }

            info!("Rolling back to snapshot ID {}", id);
            vfs.snapshot_rollback(id)
                .await
                .with_context(|| format!("Failed to rollback to snapshot {:02}", id))?;
            println!("Rolled back to snapshot {:02}", id);
        }

        SnapshotCommands::Stats => {
            let stats = vfs.snapshot_stats().await?;
            let block = BLOCK_SIZE as u64;

            println!("Snapshot Statistics:");
            println!("  Total snapshots:     {}", stats.total_snapshots);
            println!("  Free snapshot ids:   {}", stats.free_ids);
            println!(
                "  Blocks referenced:   {} ({})",
                stats.referenced_blocks,
                format_bytes(stats.referenced_blocks as u64 * block)
            );
            println!(
                "  Blocks shared:       {} ({})",
                stats.shared_blocks,
                format_bytes(stats.shared_blocks as u64 * block)
            );
            println!("  Free inodes:         {}", stats.free_inodes);
            println!(
                "  Free blocks:         {} ({})",
                stats.free_blocks,
                format_bytes(stats.free_blocks * block)
            );
        }
    }

    Ok(())
}
