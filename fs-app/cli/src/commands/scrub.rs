//! Scrub command for reference-count verification and repair

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Instant;

use snapfs::{FsConfig, ScrubReport};

use super::{finish, open_vfs};

/// Check block reference counts and allocation
#[derive(Parser)]
#[command(about = "Check and repair SnapFS reference counts")]
pub struct ScrubArgs {
    /// Image or device to scrub
    pub image: PathBuf,

    /// Rebuild reference counts and free leaked blocks
    #[arg(short, long)]
    pub repair: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ScrubArgs, config: FsConfig) -> Result<()> {
    let vfs = open_vfs(&args.image, config).await?;

    info!("Starting filesystem scrub on {:?}", args.image);
    let start_time = Instant::now();
    let report = vfs.scrub(args.repair).await;
    let duration = start_time.elapsed();

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            error!("Scrub failed: {}", e);
            return finish(vfs, Err(e.into())).await;
        }
    };
    info!("Scrub completed in {:.2} seconds", duration.as_secs_f64());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    finish(vfs, Ok(())).await?;

    if report.is_clean() {
        println!("\n✓ Filesystem is healthy - no errors found");
    } else if report.repaired && report.unallocated_references.is_empty() {
        info!("All errors were successfully repaired");
        println!("\n✓ All errors were successfully repaired");
    } else if report.repaired {
        warn!("Filesystem has errors that were not fully repaired");
        println!(
            "\n⚠ {} referenced blocks are marked free; data may be lost",
            report.unallocated_references.len()
        );
        std::process::exit(2);
    } else {
        println!("\n✗ Filesystem has errors; run with --repair to fix them");
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &ScrubReport) {
    println!("\nScrub Report:");
    println!("  Inodes scanned:         {}", report.inodes_scanned);
    println!("  Blocks referenced:      {}", report.blocks_referenced);
    println!("  Blocks shared:          {}", report.shared_blocks);
    println!("  Refcount mismatches:    {}", report.refcount_mismatches.len());
    println!("  Leaked blocks:          {}", report.leaked_blocks.len());
    println!("  Free but referenced:    {}", report.unallocated_references.len());

    for m in &report.refcount_mismatches {
        println!(
            "    block {}: expected {} references, found {}",
            m.block, m.expected, m.actual
        );
    }
    if !report.leaked_blocks.is_empty() {
        println!("    leaked: {:?}", report.leaked_blocks);
    }
    if !report.unallocated_references.is_empty() {
        println!("    free but referenced: {:?}", report.unallocated_references);
    }
}
