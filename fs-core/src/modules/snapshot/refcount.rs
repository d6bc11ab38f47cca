//! Block reference table
//!
//! Counts, per block, how many inode pointer slots (direct, indirect entry,
//! or the indirect block pointer itself) reference it across the live tree
//! and every snapshot. 0 is free, 1 is exclusively owned, 2 or more is
//! shared and must be copied before it is written.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::Result;
use crate::format::{InodeKind, NDIRECT};
use crate::layout::DiskFs;

/// Fixed-capacity reference counters behind one lock
pub struct RefTable {
    counts: Mutex<Vec<u32>>,
    capacity: u64,
}

impl RefTable {
    /// Table covering blocks `0..capacity`
    pub fn new(capacity: u64) -> Self {
        Self {
            counts: Mutex::new(vec![0; capacity as usize]),
            capacity,
        }
    }

    /// Number of blocks covered
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether `block` is covered by the table
    pub fn tracks(&self, block: u64) -> bool {
        block < self.capacity
    }

    /// Add a reference. Out-of-range blocks are ignored.
    pub fn increment(&self, block: u64) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(block as usize) {
            *count = count.saturating_add(1);
        }
    }

    /// Drop a reference; a no-op at zero. Out-of-range blocks are ignored.
    ///
    /// Returns the count left after the decrement, so a caller can decide
    /// to free the block without a second lookup racing other writers.
    pub fn decrement(&self, block: u64) -> u32 {
        let mut counts = self.counts.lock();
        match counts.get_mut(block as usize) {
            Some(count) if *count == 0 => {
                log::warn!("REFCOUNT: decrement of unreferenced block {}", block);
                0
            }
            Some(count) => {
                *count -= 1;
                *count
            }
            None => 0,
        }
    }

    /// Current count; 0 for out-of-range blocks
    pub fn get(&self, block: u64) -> u32 {
        self.counts
            .lock()
            .get(block as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Number of blocks referenced at least once
    pub fn referenced_blocks(&self) -> usize {
        self.counts.lock().iter().filter(|&&c| c > 0).count()
    }

    /// Number of blocks referenced more than once
    pub fn shared_blocks(&self) -> usize {
        self.counts.lock().iter().filter(|&&c| c > 1).count()
    }

    /// Copy of all counters
    pub(crate) fn snapshot(&self) -> Vec<u32> {
        self.counts.lock().clone()
    }

    /// Replace every counter with the given counts
    pub(crate) fn load(&self, scanned: &HashMap<u64, u32>) {
        let mut counts = self.counts.lock();
        counts.iter_mut().for_each(|c| *c = 0);
        for (&block, &count) in scanned {
            if let Some(slot) = counts.get_mut(block as usize) {
                *slot = count;
            }
        }
    }
}

/// Reference counts derived from the inode table
#[derive(Debug, Default)]
pub struct ReferenceScan {
    /// Expected count per referenced block
    pub counts: HashMap<u64, u32>,
    /// Allocated inodes seen
    pub inodes_in_use: u64,
}

impl ReferenceScan {
    /// Blocks referenced at least once
    pub fn referenced_blocks(&self) -> usize {
        self.counts.len()
    }

    /// Blocks referenced more than once
    pub fn shared_blocks(&self) -> usize {
        self.counts.values().filter(|&&c| c > 1).count()
    }

    fn add(&mut self, block: u64) {
        if block != 0 {
            *self.counts.entry(block).or_insert(0) += 1;
        }
    }
}

/// Walk every allocated inode and count its block pointers
pub(crate) async fn scan_references(fs: &DiskFs) -> Result<ReferenceScan> {
    let mut scan = ReferenceScan::default();
    for (_, inode) in fs.scan_inodes().await? {
        if inode.kind == InodeKind::Free {
            continue;
        }
        scan.inodes_in_use += 1;
        for &addr in &inode.addrs[..NDIRECT] {
            scan.add(addr);
        }
        let indirect = inode.addrs[NDIRECT];
        if indirect != 0 {
            scan.add(indirect);
            for entry in fs.read_indirect(indirect).await? {
                scan.add(entry);
            }
        }
    }
    Ok(scan)
}

/// Rebuild the in-memory table from disk; run at mount
pub(crate) async fn rebuild(fs: &DiskFs) -> Result<ReferenceScan> {
    let scan = scan_references(fs).await?;
    fs.refs.load(&scan.counts);
    Ok(scan)
}
