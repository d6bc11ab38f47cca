//! Block cache for SnapFS
//!
//! All metadata and file data go through this cache. The journal installs
//! committed blocks with [`BlockCache::write_block`] and then calls
//! [`BlockCache::flush`] so the home locations are durable before the log
//! header is cleared.

use arrayref::array_ref;
use lru::LruCache;
use parking_lot::RwLock;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blockdev::{check_transfer, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A cached block with metadata
struct CachedBlock {
    data: Box<[u8; BLOCK_SIZE]>,
    dirty: bool,
}

/// A block cache that maintains a fixed-size in-memory cache of blocks
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: RwLock<LruCache<u64, CachedBlock>>,
    write_through: bool,
}

impl BlockCache {
    /// Create a new block cache with the given capacity (in number of blocks)
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize, write_through: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            cache: RwLock::new(LruCache::new(capacity)),
            write_through,
        }
    }

    /// The device underneath this cache
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Read a block from the cache or device
    pub async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(block_num, self.device.block_count(), buf.len())?;

        {
            let mut cache = self.cache.write();
            if let Some(block) = cache.get(&block_num) {
                buf.copy_from_slice(&block.data[..]);
                return Ok(());
            }
        }

        let mut block = Box::new([0u8; BLOCK_SIZE]);
        self.device.read_block(block_num, &mut block[..]).await?;

        // Another task may have written this block while we were reading it.
        let maybe_evicted = {
            let mut cache = self.cache.write();
            if let Some(existing) = cache.peek(&block_num) {
                buf.copy_from_slice(&existing.data[..]);
                None
            } else {
                buf.copy_from_slice(&block[..]);
                cache.push(
                    block_num,
                    CachedBlock {
                        data: block,
                        dirty: false,
                    },
                )
            }
        };
        self.write_back_evicted(maybe_evicted).await
    }

    /// Write a block to the cache (and device if write-through)
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        check_transfer(block_num, self.device.block_count(), data.len())?;

        let block_data = Box::new(*array_ref!(data, 0, BLOCK_SIZE));
        if self.write_through {
            self.device.write_block(block_num, &block_data[..]).await?;
        }

        let maybe_evicted = {
            let mut cache = self.cache.write();
            cache.push(
                block_num,
                CachedBlock {
                    data: block_data,
                    dirty: !self.write_through,
                },
            )
        };
        self.write_back_evicted(maybe_evicted).await
    }

    async fn write_back_evicted(&self, evicted: Option<(u64, CachedBlock)>) -> Result<()> {
        // `push` also returns the old entry when the key was already cached.
        if let Some((evicted_block_num, evicted)) = evicted {
            let recached = self.cache.read().contains(&evicted_block_num);
            if evicted.dirty && !recached {
                self.device
                    .write_block(evicted_block_num, &evicted.data[..])
                    .await?;
            }
        }
        Ok(())
    }

    /// Flush all dirty blocks to disk
    pub async fn flush(&self) -> Result<()> {
        let dirty_blocks: Vec<(u64, Box<[u8; BLOCK_SIZE]>)> = {
            let cache = self.cache.read();
            cache
                .iter()
                .filter(|(_, block)| block.dirty)
                .map(|(block_num, block)| (*block_num, block.data.clone()))
                .collect()
        };

        let mut failed = 0usize;
        for (block_num, data) in dirty_blocks {
            if let Err(e) = self.device.write_block(block_num, &data[..]).await {
                log::error!("CACHE: failed to write back block {}: {}", block_num, e);
                failed += 1;
            } else if let Some(block) = self.cache.write().peek_mut(&block_num) {
                if block.data == data {
                    block.dirty = false;
                }
            }
        }

        if failed > 0 {
            return Err(BlockDeviceError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to write {} blocks", failed),
            )));
        }

        self.device.sync().await
    }

    /// Clear the entire cache, writing back any dirty blocks
    pub async fn clear(&self) -> Result<()> {
        self.flush().await?;
        self.cache.write().clear();
        Ok(())
    }

    /// Number of blocks currently cached
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether the cache holds no blocks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{FileBackedBlockDevice, MemBlockDevice};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cache_read_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_cache.img");
        let device = Arc::new(
            FileBackedBlockDevice::create(&path, 2 * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );

        let cache = BlockCache::new(device.clone(), 2, false);
        let test_data1 = [0xAA; BLOCK_SIZE];
        let test_data2 = [0x55; BLOCK_SIZE];
        cache.write_block(0, &test_data1).await.unwrap();
        cache.write_block(1, &test_data2).await.unwrap();

        let mut read_buf = [0u8; BLOCK_SIZE];
        cache.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(read_buf, test_data1);

        // Write-back: nothing reaches the device until flush.
        device.read_block(1, &mut read_buf).await.unwrap();
        assert_eq!(read_buf, [0u8; BLOCK_SIZE]);

        cache.flush().await.unwrap();
        device.read_block(1, &mut read_buf).await.unwrap();
        assert_eq!(read_buf, test_data2);
    }

    #[tokio::test]
    async fn test_eviction_writes_back_dirty_blocks() {
        let device = Arc::new(MemBlockDevice::new(4));
        let cache = BlockCache::new(device.clone(), 2, false);

        for i in 0..3u64 {
            cache
                .write_block(i, &[i as u8 + 0x11; BLOCK_SIZE])
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);

        // Block 0 was evicted and must have been written back.
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buf).await.unwrap();
        assert_eq!(buf, [0x11; BLOCK_SIZE]);

        cache.read_block(0, &mut buf).await.unwrap();
        assert_eq!(buf, [0x11; BLOCK_SIZE]);
    }

    #[tokio::test]
    async fn test_write_through_reaches_device() {
        let device = Arc::new(MemBlockDevice::new(2));
        let cache = BlockCache::new(device.clone(), 8, true);
        cache.write_block(1, &[0x42; BLOCK_SIZE]).await.unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(1, &mut buf).await.unwrap();
        assert_eq!(buf, [0x42; BLOCK_SIZE]);

        assert!(matches!(
            cache.read_block(2, &mut buf).await,
            Err(BlockDeviceError::InvalidBlockNumber(2))
        ));
    }
}
