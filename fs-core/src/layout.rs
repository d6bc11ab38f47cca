//! On-disk layout and the mounted filesystem core

use parking_lot::Mutex;
use std::sync::Arc;

use crate::block_bitmap::{BlockBitmap, BITS_PER_BLOCK};
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::config::FsConfig;
use crate::error::{Error, Result};
use crate::format::{Superblock, INODES_PER_BLOCK, INODE_SIZE};
use crate::inode::InodeCache;
use crate::modules::journaling::JournalManager;
use crate::modules::snapshot::refcount::{self, RefTable};

/// Block numbers for important filesystem structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Total blocks on the device
    pub block_count: u64,
    /// Inode slots, including the unused slot 0
    pub inode_count: u64,
    /// Journal header block
    pub journal_start: u64,
    /// Journal size in blocks, header included
    pub journal_blocks: u64,
    /// First block of the free bitmap
    pub bitmap_start: u64,
    /// Number of bitmap blocks
    pub bitmap_blocks: u64,
    /// First block of the inode table
    pub inode_table_start: u64,
    /// Number of inode table blocks
    pub inode_table_blocks: u64,
    /// First data block
    pub data_start: u64,
    /// Number of data blocks
    pub data_blocks_count: u64,
}

impl Layout {
    /// Calculate the layout for a filesystem with the given parameters
    pub fn new(block_count: u64, inode_count: u64, journal_blocks: u64) -> Self {
        let journal_start = 1;
        let bitmap_start = journal_start + journal_blocks;
        let bitmap_blocks = block_count.div_ceil(BITS_PER_BLOCK).max(1);
        let inode_table_start = bitmap_start + bitmap_blocks;
        let inode_table_blocks = inode_count.div_ceil(INODES_PER_BLOCK);
        let data_start = inode_table_start + inode_table_blocks;

        Self {
            block_count,
            inode_count,
            journal_start,
            journal_blocks,
            bitmap_start,
            bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            data_start,
            data_blocks_count: block_count.saturating_sub(data_start),
        }
    }

    /// Get the block number and byte offset for a given inode number
    pub fn inode_block(&self, inode_num: u64) -> (u64, usize) {
        let block = self.inode_table_start + inode_num / INODES_PER_BLOCK;
        let offset = (inode_num % INODES_PER_BLOCK) as usize * INODE_SIZE;
        (block, offset)
    }

    /// Whether `block` lies in the data region
    pub fn is_data_block(&self, block: u64) -> bool {
        block >= self.data_start && block < self.block_count
    }
}

/// A mounted filesystem
///
/// Owns the block cache, journal, allocator, block reference table and
/// inode cache. Inode, directory and snapshot operations are implemented
/// on this type in their own modules.
pub struct DiskFs {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) cache: BlockCache,
    pub(crate) journal: JournalManager,
    pub(crate) bitmap: Mutex<BlockBitmap>,
    pub(crate) refs: RefTable,
    pub(crate) icache: InodeCache,
    /// Serializes read-modify-write of inode table blocks
    pub(crate) itable_lock: tokio::sync::Mutex<()>,
    superblock: Superblock,
    layout: Layout,
    config: FsConfig,
}

impl DiskFs {
    /// Mount the filesystem on `device`
    ///
    /// Replays the journal, loads the free bitmap and rebuilds the block
    /// reference table from the inode table.
    pub async fn open(device: Arc<dyn BlockDevice>, config: FsConfig) -> Result<Self> {
        let superblock = Superblock::load(device.as_ref()).await?;
        let layout = superblock.layout();
        log::info!(
            "LAYOUT: mounting volume '{}' ({} blocks, {} inodes)",
            superblock.volume_name(),
            layout.block_count,
            layout.inode_count
        );

        let cache = BlockCache::new(device.clone(), config.cache_blocks, config.write_through);
        let journal = JournalManager::new(
            device.clone(),
            layout.journal_start,
            layout.journal_blocks,
            config.journal.clone(),
        );
        journal.recover(&cache).await?;

        let bitmap = BlockBitmap::load(&cache, &layout).await?;

        let capacity = config.refcount_capacity.unwrap_or(layout.block_count);
        if capacity < layout.block_count {
            log::warn!(
                "LAYOUT: reference table covers {} of {} blocks; blocks beyond it are never shared or freed",
                capacity,
                layout.block_count
            );
        }

        let fs = Self {
            device,
            cache,
            journal,
            bitmap: Mutex::new(bitmap),
            refs: RefTable::new(capacity),
            icache: InodeCache::new(config.inode_cache_slots),
            itable_lock: tokio::sync::Mutex::new(()),
            superblock,
            layout,
            config,
        };

        let scan = refcount::rebuild(&fs).await?;
        log::info!(
            "LAYOUT: mounted, {} inodes in use, {} blocks referenced, {} shared",
            scan.inodes_in_use,
            scan.referenced_blocks(),
            scan.shared_blocks()
        );
        Ok(fs)
    }

    /// The superblock read at mount
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Region boundaries
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Mount configuration
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// The block reference table
    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    /// Journal manager
    pub fn journal(&self) -> &JournalManager {
        &self.journal
    }

    /// Start a journaled operation
    pub async fn begin_op(&self) {
        self.journal.begin_op().await;
    }

    /// Finish a journaled operation, committing if it was the last one open
    pub async fn end_op(&self) -> Result<()> {
        self.journal.end_op(&self.cache).await?;
        Ok(())
    }

    /// Run `f` as one journaled operation
    ///
    /// The operation is closed even when `f` fails; the error from `f` wins
    /// over a commit error.
    pub async fn run_op<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.begin_op().await;
        let result = f().await;
        let committed = self.end_op().await;
        let value = result?;
        committed?;
        Ok(value)
    }

    /// Largest byte count one journaled write should carry
    pub fn max_write_bytes(&self) -> usize {
        let max_op_blocks = self.journal.config().max_op_blocks as usize;
        (max_op_blocks.saturating_sub(4) / 2).max(1) * BLOCK_SIZE
    }

    /// Read a block, seeing uncommitted images of the current group first
    pub async fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        if self.journal.read_pending(block, buf) {
            return Ok(());
        }
        self.cache.read_block(block, buf).await?;
        Ok(())
    }

    /// Write a block through the journal
    pub fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        self.journal.log_write(block, data)?;
        Ok(())
    }

    /// Allocate and zero a data block
    ///
    /// The caller installs the pointer and increments its reference count.
    pub fn alloc_block(&self) -> Result<u64> {
        let mut bitmap = self.bitmap.lock();
        let block = bitmap.allocate().ok_or(Error::NoFreeBlocks)?;

        let (bitmap_block, image) = bitmap.block_image(block);
        let logged = self
            .journal
            .log_write(bitmap_block, image)
            .and_then(|_| self.journal.log_write(block, &[0u8; BLOCK_SIZE]));
        if let Err(e) = logged {
            // Not logged, so the allocation never reaches disk.
            bitmap.free(block)?;
            return Err(e.into());
        }
        Ok(block)
    }

    /// Return a block to the free pool
    pub fn free_block(&self, block: u64) -> Result<()> {
        let mut bitmap = self.bitmap.lock();
        bitmap.free(block)?;
        let (bitmap_block, image) = bitmap.block_image(block);
        self.journal.log_write(bitmap_block, image)?;
        Ok(())
    }

    /// Drop one reference to `block`, freeing it when none remain
    ///
    /// Returns whether the block was freed. Blocks beyond the reference
    /// table's capacity are never freed.
    pub fn release_block(&self, block: u64) -> Result<bool> {
        if !self.refs.tracks(block) {
            log::warn!("LAYOUT: block {} is outside the reference table, leaking it", block);
            return Ok(false);
        }
        if self.refs.decrement(block) == 0 {
            self.free_block(block)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Number of free data blocks
    pub fn free_blocks(&self) -> u64 {
        self.bitmap.lock().free_blocks()
    }

    /// Whether `block` is marked allocated in the free bitmap
    pub fn is_block_allocated(&self, block: u64) -> bool {
        self.bitmap.lock().is_allocated(block)
    }

    /// Flush everything and close the device
    pub async fn shutdown(&self) -> Result<()> {
        if !self.journal.is_idle() {
            log::warn!("LAYOUT: shutting down with journal operations still open");
        }
        self.cache.flush().await?;
        self.device.close().await?;
        log::info!(
            "LAYOUT: unmounted after {} journal commits",
            self.journal.commits()
        );
        Ok(())
    }
}
