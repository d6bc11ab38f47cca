//! Journaling module for SnapFS
//!
//! This module implements a group-commit write-ahead redo log. Every
//! filesystem mutation runs between [`JournalManager::begin_op`] and
//! [`JournalManager::end_op`]; block images written in between are held in
//! memory and reach their home locations only after the whole group has been
//! logged and the commit header is durable.
//!
//! On-disk, the journal region starts with one header block followed by the
//! log blocks. A header with a zero block count means "nothing to replay".

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::cache::BlockCache;

/// Magic number at the start of a commit header
const JOURNAL_MAGIC: &[u8; 8] = b"SNAPJRNL";

/// Journal error types
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Journal is full ({0} blocks)")]
    Full(u64),
    #[error("Block write outside of a transaction")]
    NotInTransaction,
    #[error("Corrupt journal header: {0}")]
    CorruptHeader(String),
}

/// Journal manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Upper bound on distinct blocks a single operation may log
    pub max_op_blocks: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { max_op_blocks: 32 }
    }
}

/// Commit record stored in the first journal block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    /// Commit sequence number
    pub sequence: u64,
    /// Home locations of the logged blocks, in log order
    pub blocks: Vec<u64>,
    /// CRC32 over the block list and the logged block contents
    pub checksum: u32,
}

impl JournalHeader {
    /// Size of the fixed part of the header in bytes
    pub const FIXED_SIZE: usize = 8 + 8 + 4 + 4;
    /// Most block numbers a header block can hold
    pub const MAX_BLOCKS: usize = (BLOCK_SIZE - Self::FIXED_SIZE) / 8;

    /// Serialize the header into one block
    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_all(JOURNAL_MAGIC)?;
        cursor.write_u64::<LittleEndian>(self.sequence)?;
        cursor.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        cursor.write_u32::<LittleEndian>(self.checksum)?;
        for &block in &self.blocks {
            cursor.write_u64::<LittleEndian>(block)?;
        }
        Ok(buf)
    }

    /// Deserialize a header block; `Ok(None)` means the journal is empty
    pub fn from_bytes(data: &[u8]) -> Result<Option<Self>, JournalError> {
        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Ok(None);
        }

        let sequence = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let checksum = cursor.read_u32::<LittleEndian>()?;
        if count == 0 {
            return Ok(None);
        }
        if count > Self::MAX_BLOCKS {
            return Err(JournalError::CorruptHeader(format!(
                "{} blocks exceeds header capacity",
                count
            )));
        }

        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(cursor.read_u64::<LittleEndian>()?);
        }
        Ok(Some(Self {
            sequence,
            blocks,
            checksum,
        }))
    }

    /// Checksum of a commit's block list and contents
    pub fn compute_checksum<'a>(entries: impl Iterator<Item = (u64, &'a [u8])>) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (block, data) in entries {
            hasher.update(&block.to_le_bytes());
            hasher.update(data);
        }
        hasher.finalize()
    }
}

type BlockImage = Box<[u8; BLOCK_SIZE]>;

struct JournalState {
    /// Operations between begin_op and end_op
    outstanding: u64,
    /// A commit is writing the log
    committing: bool,
    /// Block images of the current group, keyed by home location
    pending: BTreeMap<u64, BlockImage>,
}

/// Journal manager for group commit and crash recovery
pub struct JournalManager {
    device: Arc<dyn BlockDevice>,
    config: JournalConfig,
    /// Header block number; log blocks follow it
    start: u64,
    /// Number of log blocks usable by one commit
    capacity: u64,
    state: Mutex<JournalState>,
    wakeup: Notify,
    sequence: AtomicU64,
    commits: AtomicU64,
}

impl JournalManager {
    /// Create a journal over `journal_blocks` blocks starting at `start`
    pub fn new(
        device: Arc<dyn BlockDevice>,
        start: u64,
        journal_blocks: u64,
        mut config: JournalConfig,
    ) -> Self {
        let capacity = journal_blocks
            .saturating_sub(1)
            .min(JournalHeader::MAX_BLOCKS as u64);
        if config.max_op_blocks > capacity || config.max_op_blocks == 0 {
            log::warn!(
                "JOURNAL: max_op_blocks {} does not fit a {} block log, clamping",
                config.max_op_blocks,
                capacity
            );
            config.max_op_blocks = capacity.max(1);
        }

        Self {
            device,
            config,
            start,
            capacity,
            state: Mutex::new(JournalState {
                outstanding: 0,
                committing: false,
                pending: BTreeMap::new(),
            }),
            wakeup: Notify::new(),
            sequence: AtomicU64::new(1),
            commits: AtomicU64::new(0),
        }
    }

    /// Log blocks available to one commit
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Effective configuration
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Number of commits since mount
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Start a filesystem operation, waiting for log space if needed
    pub async fn begin_op(&self) {
        loop {
            let notified = self.wakeup.notified();
            {
                let mut state = self.state.lock();
                let reserved = (state.outstanding + 1) * self.config.max_op_blocks;
                if !state.committing && state.pending.len() as u64 + reserved <= self.capacity {
                    state.outstanding += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Record a block image in the current group
    ///
    /// Repeated writes of one block inside a group are absorbed into a
    /// single log slot.
    pub fn log_write(&self, block_num: u64, data: &[u8]) -> Result<(), JournalError> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()).into());
        }

        let mut state = self.state.lock();
        if state.outstanding == 0 {
            return Err(JournalError::NotInTransaction);
        }
        if let Some(image) = state.pending.get_mut(&block_num) {
            image.copy_from_slice(data);
            return Ok(());
        }
        if state.pending.len() as u64 >= self.capacity {
            return Err(JournalError::Full(self.capacity));
        }

        let mut image = Box::new([0u8; BLOCK_SIZE]);
        image.copy_from_slice(data);
        state.pending.insert(block_num, image);
        Ok(())
    }

    /// Copy the uncommitted image of `block_num` into `buf`, if there is one
    pub fn read_pending(&self, block_num: u64, buf: &mut [u8]) -> bool {
        let state = self.state.lock();
        match state.pending.get(&block_num) {
            Some(image) => {
                buf.copy_from_slice(&image[..]);
                true
            }
            None => false,
        }
    }

    /// Finish an operation; the last one out commits the group
    pub async fn end_op(&self, cache: &BlockCache) -> Result<(), JournalError> {
        let entries: Vec<(u64, BlockImage)> = {
            let mut state = self.state.lock();
            if state.outstanding == 0 {
                return Err(JournalError::NotInTransaction);
            }
            state.outstanding -= 1;
            if state.outstanding > 0 {
                // Freed reservation may let a waiter in.
                self.wakeup.notify_waiters();
                return Ok(());
            }
            state.committing = true;
            state
                .pending
                .iter()
                .map(|(block, image)| (*block, image.clone()))
                .collect()
        };

        let result = if entries.is_empty() {
            Ok(())
        } else {
            self.commit(cache, &entries).await
        };

        {
            // A failed group is dropped; whatever reached the log is left
            // for recovery at the next mount.
            let mut state = self.state.lock();
            state.committing = false;
            state.pending.clear();
        }
        self.wakeup.notify_waiters();

        if let Err(e) = &result {
            log::error!("JOURNAL: commit of {} blocks failed, group discarded: {}", entries.len(), e);
        }
        result
    }

    async fn commit(&self, cache: &BlockCache, entries: &[(u64, BlockImage)]) -> Result<(), JournalError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        for (i, (_, image)) in entries.iter().enumerate() {
            self.device
                .write_block(self.start + 1 + i as u64, &image[..])
                .await?;
        }
        self.device.sync().await?;

        let header = JournalHeader {
            sequence,
            blocks: entries.iter().map(|(block, _)| *block).collect(),
            checksum: JournalHeader::compute_checksum(
                entries.iter().map(|(block, image)| (*block, &image[..])),
            ),
        };
        self.device.write_block(self.start, &header.to_bytes()?).await?;
        self.device.sync().await?;

        self.install(cache, entries.iter().map(|(block, image)| (*block, &image[..])))
            .await?;
        self.clear_header().await?;

        self.commits.fetch_add(1, Ordering::Relaxed);
        log::debug!("JOURNAL: committed sequence {} ({} blocks)", sequence, entries.len());
        Ok(())
    }

    async fn install<'a>(
        &self,
        cache: &BlockCache,
        entries: impl Iterator<Item = (u64, &'a [u8])>,
    ) -> Result<(), JournalError> {
        for (block, data) in entries {
            cache.write_block(block, data).await?;
        }
        cache.flush().await?;
        Ok(())
    }

    async fn clear_header(&self) -> Result<(), JournalError> {
        self.device
            .write_block(self.start, &vec![0u8; BLOCK_SIZE])
            .await?;
        self.device.sync().await?;
        Ok(())
    }

    /// Replay a committed group left behind by a crash
    ///
    /// Returns the number of blocks installed. A header whose checksum does
    /// not match its log blocks is a torn commit and is discarded.
    pub async fn recover(&self, cache: &BlockCache) -> Result<usize, JournalError> {
        log::info!("JOURNAL: starting recovery");

        let mut header_block = vec![0u8; BLOCK_SIZE];
        self.device.read_block(self.start, &mut header_block).await?;
        let header = match JournalHeader::from_bytes(&header_block) {
            Ok(Some(header)) => header,
            Ok(None) => {
                log::info!("JOURNAL: clean, nothing to replay");
                return Ok(0);
            }
            Err(e) => {
                log::warn!("JOURNAL: discarding unreadable header: {}", e);
                self.clear_header().await?;
                return Ok(0);
            }
        };

        if header.blocks.len() as u64 > self.capacity {
            log::warn!(
                "JOURNAL: header lists {} blocks but the log holds {}, discarding",
                header.blocks.len(),
                self.capacity
            );
            self.clear_header().await?;
            return Ok(0);
        }

        let mut images = Vec::with_capacity(header.blocks.len());
        for (i, &block) in header.blocks.iter().enumerate() {
            let mut image = vec![0u8; BLOCK_SIZE];
            self.device
                .read_block(self.start + 1 + i as u64, &mut image)
                .await?;
            images.push((block, image));
        }

        let checksum = JournalHeader::compute_checksum(
            images.iter().map(|(block, image)| (*block, image.as_slice())),
        );
        if checksum != header.checksum {
            log::warn!(
                "JOURNAL: checksum mismatch in sequence {}, discarding torn commit",
                header.sequence
            );
            self.clear_header().await?;
            return Ok(0);
        }

        self.install(cache, images.iter().map(|(block, image)| (*block, image.as_slice())))
            .await?;
        self.clear_header().await?;
        self.sequence.store(header.sequence + 1, Ordering::SeqCst);

        log::info!(
            "JOURNAL: recovery complete, replayed sequence {} ({} blocks)",
            header.sequence,
            images.len()
        );
        Ok(images.len())
    }

    /// Whether any operation is open or any block is waiting to commit
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.outstanding == 0 && !state.committing && state.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    fn setup(journal_blocks: u64) -> (Arc<MemBlockDevice>, BlockCache, JournalManager) {
        let device = Arc::new(MemBlockDevice::new(64));
        let cache = BlockCache::new(device.clone(), 16, true);
        let journal = JournalManager::new(
            device.clone(),
            1,
            journal_blocks,
            JournalConfig { max_op_blocks: 4 },
        );
        (device, cache, journal)
    }

    #[test]
    fn test_header_serialization() {
        let header = JournalHeader {
            sequence: 7,
            blocks: vec![40, 41, 50],
            checksum: 0xDEADBEEF,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(JournalHeader::from_bytes(&bytes).unwrap(), Some(header));
        assert_eq!(JournalHeader::from_bytes(&vec![0u8; BLOCK_SIZE]).unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_installs_blocks() {
        let (device, cache, journal) = setup(16);

        journal.begin_op().await;
        journal.log_write(40, &[1u8; BLOCK_SIZE]).unwrap();
        journal.log_write(40, &[2u8; BLOCK_SIZE]).unwrap();
        journal.log_write(41, &[3u8; BLOCK_SIZE]).unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        assert!(journal.read_pending(40, &mut buf));
        assert_eq!(buf, [2u8; BLOCK_SIZE]);
        device.read_block(40, &mut buf).await.unwrap();
        assert_eq!(buf, [0u8; BLOCK_SIZE]);

        journal.end_op(&cache).await.unwrap();
        assert!(journal.is_idle());
        assert_eq!(journal.commits(), 1);

        device.read_block(40, &mut buf).await.unwrap();
        assert_eq!(buf, [2u8; BLOCK_SIZE]);
        device.read_block(41, &mut buf).await.unwrap();
        assert_eq!(buf, [3u8; BLOCK_SIZE]);

        // Header is cleared after installation.
        device.read_block(1, &mut buf).await.unwrap();
        assert_eq!(JournalHeader::from_bytes(&buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_log_write_outside_op_rejected() {
        let (_device, _cache, journal) = setup(16);
        let err = journal.log_write(40, &[0u8; BLOCK_SIZE]).unwrap_err();
        assert!(matches!(err, JournalError::NotInTransaction));
    }

    #[tokio::test]
    async fn test_journal_full() {
        let (_device, cache, journal) = setup(5);
        assert_eq!(journal.capacity(), 4);

        journal.begin_op().await;
        for block in 40..44 {
            journal.log_write(block, &[9u8; BLOCK_SIZE]).unwrap();
        }
        assert!(matches!(
            journal.log_write(44, &[9u8; BLOCK_SIZE]),
            Err(JournalError::Full(4))
        ));
        // Rewriting an already-logged block still fits.
        journal.log_write(43, &[8u8; BLOCK_SIZE]).unwrap();
        journal.end_op(&cache).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_commit_releases_log_space() {
        let device = Arc::new(MemBlockDevice::new(64).read_only_copy());
        let cache = BlockCache::new(device.clone(), 16, true);
        let journal = JournalManager::new(device, 1, 16, JournalConfig { max_op_blocks: 4 });

        journal.begin_op().await;
        for block in 40..52 {
            journal.log_write(block, &[3u8; BLOCK_SIZE]).unwrap();
        }
        assert!(journal.end_op(&cache).await.is_err());
        assert!(journal.is_idle());

        // Twelve stale images plus a fresh reservation would not fit.
        tokio::time::timeout(std::time::Duration::from_secs(1), journal.begin_op())
            .await
            .expect("begin_op stalled after a failed commit");
        journal.log_write(40, &[4u8; BLOCK_SIZE]).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(!journal.read_pending(41, &mut buf));
    }

    #[tokio::test]
    async fn test_recovery_replays_committed_header() {
        let (device, cache, journal) = setup(16);

        // Simulate a crash after the header was written but before install.
        let image = [0x5Au8; BLOCK_SIZE];
        device.write_block(2, &image).await.unwrap();
        let header = JournalHeader {
            sequence: 3,
            blocks: vec![50],
            checksum: JournalHeader::compute_checksum(std::iter::once((50u64, &image[..]))),
        };
        device.write_block(1, &header.to_bytes().unwrap()).await.unwrap();

        assert_eq!(journal.recover(&cache).await.unwrap(), 1);
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(50, &mut buf).await.unwrap();
        assert_eq!(buf, image);
        assert_eq!(journal.recover(&cache).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recovery_discards_torn_commit() {
        let (device, cache, journal) = setup(16);

        device.write_block(2, &[0x11u8; BLOCK_SIZE]).await.unwrap();
        let header = JournalHeader {
            sequence: 1,
            blocks: vec![50],
            checksum: 12345,
        };
        device.write_block(1, &header.to_bytes().unwrap()).await.unwrap();

        assert_eq!(journal.recover(&cache).await.unwrap(), 0);
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(50, &mut buf).await.unwrap();
        assert_eq!(buf, [0u8; BLOCK_SIZE]);
    }

    #[tokio::test]
    async fn test_concurrent_ops_group_commit() {
        let (device, cache, journal) = setup(32);
        let journal = Arc::new(journal);
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for i in 0..4u64 {
            let journal = journal.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                journal.begin_op().await;
                journal.log_write(40 + i, &[i as u8 + 1; BLOCK_SIZE]).unwrap();
                tokio::task::yield_now().await;
                journal.end_op(&cache).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(journal.is_idle());
        for i in 0..4u64 {
            let mut buf = [0u8; BLOCK_SIZE];
            device.read_block(40 + i, &mut buf).await.unwrap();
            assert_eq!(buf, [i as u8 + 1; BLOCK_SIZE]);
        }
    }
}
