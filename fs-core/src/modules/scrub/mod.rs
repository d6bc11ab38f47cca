//! Consistency scrub for SnapFS
//!
//! Recomputes every block reference count from the inode table and checks
//! the result against the in-memory reference table and the free bitmap.
//! Results are only exact while no writer is active.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::Result;
use crate::layout::DiskFs;
use crate::modules::snapshot::refcount::scan_references;

/// Leaked blocks freed per journal operation during repair
const FREE_BATCH: usize = 64;

/// A block whose tracked count differs from the inode table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMismatch {
    /// Block number
    pub block: u64,
    /// Count implied by the inode table
    pub expected: u32,
    /// Count held by the reference table
    pub actual: u32,
}

/// Scrub results
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ScrubReport {
    /// Allocated inodes scanned
    pub inodes_scanned: u64,
    /// Blocks referenced by at least one inode
    pub blocks_referenced: usize,
    /// Blocks referenced by more than one inode slot
    pub shared_blocks: usize,
    /// Reference table entries that disagree with the inode table
    pub refcount_mismatches: Vec<RefMismatch>,
    /// Allocated data blocks nothing points at
    pub leaked_blocks: Vec<u64>,
    /// Referenced blocks the bitmap has marked free
    pub unallocated_references: Vec<u64>,
    /// Whether repairs were applied
    pub repaired: bool,
}

impl ScrubReport {
    /// True when no inconsistency was found
    pub fn is_clean(&self) -> bool {
        self.refcount_mismatches.is_empty()
            && self.leaked_blocks.is_empty()
            && self.unallocated_references.is_empty()
    }
}

/// Check reference counts and block allocation, optionally repairing them
///
/// Repair reloads the reference table from the inode table and returns
/// leaked blocks to the free pool. References to free blocks are reported
/// only.
pub async fn scrub(fs: &DiskFs, repair: bool) -> Result<ScrubReport> {
    let scan = scan_references(fs).await?;
    let tracked = fs.refs().snapshot();

    let mut report = ScrubReport {
        inodes_scanned: scan.inodes_in_use,
        blocks_referenced: scan.referenced_blocks(),
        shared_blocks: scan.shared_blocks(),
        ..Default::default()
    };

    for (block, &actual) in tracked.iter().enumerate() {
        let block = block as u64;
        let expected = scan.counts.get(&block).copied().unwrap_or(0);
        if expected != actual {
            report.refcount_mismatches.push(RefMismatch { block, expected, actual });
        }
    }

    let allocated: HashSet<u64> = fs.bitmap.lock().allocated_data_blocks().collect();
    report.leaked_blocks = allocated
        .iter()
        .copied()
        .filter(|b| !scan.counts.contains_key(b))
        .collect();
    report.leaked_blocks.sort_unstable();
    report.unallocated_references = scan
        .counts
        .keys()
        .copied()
        .filter(|b| !allocated.contains(b))
        .collect();
    report.unallocated_references.sort_unstable();

    for m in &report.refcount_mismatches {
        log::warn!(
            "SCRUB: block {} has {} references but the table holds {}",
            m.block,
            m.expected,
            m.actual
        );
    }
    for block in &report.unallocated_references {
        log::error!("SCRUB: block {} is referenced but marked free", block);
    }

    if repair && !report.is_clean() {
        fs.refs().load(&scan.counts);
        for batch in report.leaked_blocks.chunks(FREE_BATCH) {
            fs.run_op(|| async move {
                for &block in batch {
                    fs.free_block(block)?;
                }
                Ok(())
            })
            .await?;
        }
        report.repaired = true;
        log::info!(
            "SCRUB: repaired {} reference counts, freed {} leaked blocks",
            report.refcount_mismatches.len(),
            report.leaked_blocks.len()
        );
    }

    log::info!(
        "SCRUB: {} inodes, {} blocks referenced ({} shared), {} mismatches, {} leaked",
        report.inodes_scanned,
        report.blocks_referenced,
        report.shared_blocks,
        report.refcount_mismatches.len(),
        report.leaked_blocks.len()
    );
    Ok(report)
}
