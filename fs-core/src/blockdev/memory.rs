//! RAM-backed block device, used by tests and benchmarks

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{check_transfer, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block device whose contents live in memory
pub struct MemBlockDevice {
    blocks: RwLock<Vec<Box<[u8; BLOCK_SIZE]>>>,
    read_only: bool,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `block_count` blocks
    pub fn new(block_count: u64) -> Self {
        let blocks = (0..block_count)
            .map(|_| Box::new([0u8; BLOCK_SIZE]))
            .collect();
        Self {
            blocks: RwLock::new(blocks),
            read_only: false,
        }
    }

    /// Copy of the device contents as a read-only device
    pub fn read_only_copy(&self) -> Self {
        Self {
            blocks: RwLock::new(self.blocks.read().clone()),
            read_only: true,
        }
    }
}

impl std::fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockDevice")
            .field("block_count", &self.blocks.read().len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.read();
        check_transfer(block_num, blocks.len() as u64, buf.len())?;
        buf.copy_from_slice(&blocks[block_num as usize][..]);
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        let mut blocks = self.blocks.write();
        check_transfer(block_num, blocks.len() as u64, data.len())?;
        blocks[block_num as usize].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks.read().len() as u64
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
