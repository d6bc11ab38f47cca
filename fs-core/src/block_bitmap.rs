//! Block bitmap for SnapFS
//!
//! One bit per device block, stored in the bitmap region. Blocks in the
//! metadata regions are marked allocated at format time, so the allocator
//! only ever hands out data blocks. The in-memory copy is authoritative while
//! mounted; every change is pushed into the journal as a whole bitmap block
//! image by the caller.

use thiserror::Error;

use crate::blockdev::{BlockDeviceError, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::layout::Layout;

/// Bits tracked by one bitmap block
pub const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

/// Error type for block bitmap operations
#[derive(Error, Debug)]
pub enum BlockBitmapError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Block {0} is already free")]
    BlockAlreadyFree(u64),
}

/// Block bitmap for tracking allocated/free blocks
pub struct BlockBitmap {
    /// Bitmap data (each bit represents one block)
    bitmap: Vec<u8>,
    /// Total number of blocks on the device
    total_blocks: u64,
    /// Number of free blocks
    free_blocks: u64,
    /// First block the allocator may hand out
    data_blocks_start: u64,
    /// First block of the on-disk bitmap region
    bitmap_start: u64,
    /// Search hint: lowest block that might be free
    next_hint: u64,
}

impl BlockBitmap {
    /// Create a bitmap with every data block free
    pub fn new(total_blocks: u64, data_blocks_start: u64, bitmap_start: u64) -> Self {
        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BLOCK).max(1);
        let mut bitmap = Self {
            bitmap: vec![0u8; (bitmap_blocks as usize) * BLOCK_SIZE],
            total_blocks,
            free_blocks: 0,
            data_blocks_start,
            bitmap_start,
            next_hint: data_blocks_start,
        };
        for block in 0..data_blocks_start.min(total_blocks) {
            bitmap.set(block);
        }
        bitmap.free_blocks = total_blocks.saturating_sub(data_blocks_start);
        bitmap
    }

    /// Load the bitmap region through the block cache
    pub async fn load(cache: &BlockCache, layout: &Layout) -> Result<Self, BlockBitmapError> {
        let mut bitmap = vec![0u8; (layout.bitmap_blocks as usize) * BLOCK_SIZE];
        for (i, chunk) in bitmap.chunks_mut(BLOCK_SIZE).enumerate() {
            cache
                .read_block(layout.bitmap_start + i as u64, chunk)
                .await?;
        }

        let mut loaded = Self {
            bitmap,
            total_blocks: layout.block_count,
            free_blocks: 0,
            data_blocks_start: layout.data_start,
            bitmap_start: layout.bitmap_start,
            next_hint: layout.data_start,
        };
        loaded.free_blocks = (loaded.data_blocks_start..loaded.total_blocks)
            .filter(|&block| !loaded.is_allocated(block))
            .count() as u64;

        log::info!(
            "BLOCK_BITMAP: Loaded from disk - {} free blocks out of {} data blocks",
            loaded.free_blocks,
            layout.data_blocks_count
        );
        Ok(loaded)
    }

    fn set(&mut self, block: u64) {
        self.bitmap[(block / 8) as usize] |= 1 << (block % 8);
    }

    fn clear(&mut self, block: u64) {
        self.bitmap[(block / 8) as usize] &= !(1 << (block % 8));
    }

    /// Allocate a free data block, returning its absolute block number
    pub fn allocate(&mut self) -> Option<u64> {
        if self.free_blocks == 0 {
            log::warn!("BlockBitmap::allocate: No free blocks available");
            return None;
        }

        let start = self.next_hint.max(self.data_blocks_start);
        let found = (start..self.total_blocks)
            .chain(self.data_blocks_start..start)
            .find(|&block| !self.is_allocated(block));

        match found {
            Some(block) => {
                self.set(block);
                self.free_blocks -= 1;
                self.next_hint = block + 1;
                log::debug!(
                    "BlockBitmap::allocate: allocated block {}, {} free remaining",
                    block,
                    self.free_blocks
                );
                Some(block)
            }
            None => {
                log::error!(
                    "BlockBitmap::allocate: No free block found despite {} free count",
                    self.free_blocks
                );
                None
            }
        }
    }

    /// Free a data block
    pub fn free(&mut self, block: u64) -> Result<(), BlockBitmapError> {
        if block < self.data_blocks_start || block >= self.total_blocks {
            return Err(BlockBitmapError::InvalidBlockNumber(block));
        }
        if !self.is_allocated(block) {
            return Err(BlockBitmapError::BlockAlreadyFree(block));
        }

        self.clear(block);
        self.free_blocks += 1;
        self.next_hint = self.next_hint.min(block);
        log::debug!(
            "BlockBitmap::free: freed block {}, {} free total",
            block,
            self.free_blocks
        );
        Ok(())
    }

    /// Check if a block is allocated
    pub fn is_allocated(&self, block: u64) -> bool {
        if block >= self.total_blocks {
            return false;
        }
        (self.bitmap[(block / 8) as usize] & (1 << (block % 8))) != 0
    }

    /// Bitmap block holding the bit for `block`, and that block's current contents
    pub fn block_image(&self, block: u64) -> (u64, &[u8]) {
        let index = block / BITS_PER_BLOCK;
        let start = index as usize * BLOCK_SIZE;
        (
            self.bitmap_start + index,
            &self.bitmap[start..start + BLOCK_SIZE],
        )
    }

    /// Allocated blocks in the data region
    pub fn allocated_data_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        (self.data_blocks_start..self.total_blocks).filter(move |&block| self.is_allocated(block))
    }

    /// Get the number of free blocks
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    /// Get the number of data blocks
    pub fn data_blocks(&self) -> u64 {
        self.total_blocks.saturating_sub(self.data_blocks_start)
    }
}

impl std::fmt::Debug for BlockBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBitmap")
            .field("total_blocks", &self.total_blocks)
            .field("free_blocks", &self.free_blocks)
            .field("data_blocks_start", &self.data_blocks_start)
            .finish()
    }
}
