//! In-memory inodes and inode-level block operations
//!
//! The inode cache hands out reference-counted handles; an inode's on-disk
//! contents are loaded lazily the first time it is locked. All mutating
//! operations here must run inside a journaled operation.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::{DiskInode, InodeKind, INODES_PER_BLOCK, INODE_SIZE, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT};
use crate::layout::DiskFs;
use crate::modules::snapshot::cow;

/// Seconds since the epoch, for inode timestamps
pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Lockable contents of a cached inode
#[derive(Debug)]
pub struct InodeState {
    pub(crate) inum: u64,
    /// Whether `disk` has been loaded from the inode table
    pub(crate) valid: bool,
    /// Copy of the on-disk inode
    pub disk: DiskInode,
}

impl InodeState {
    /// Inode number
    pub fn inum(&self) -> u64 {
        self.inum
    }

    /// Inode type
    pub fn kind(&self) -> InodeKind {
        self.disk.kind
    }

    /// Whether this inode is a directory
    pub fn is_dir(&self) -> bool {
        self.disk.kind == InodeKind::Directory
    }
}

/// A cached inode shared by every holder of its number
#[derive(Debug)]
pub struct CachedInode {
    inum: u64,
    state: tokio::sync::Mutex<InodeState>,
}

impl CachedInode {
    /// Inode number
    pub fn inum(&self) -> u64 {
        self.inum
    }
}

/// Counted handle returned by [`DiskFs::iget`]; release with [`DiskFs::iput`]
pub type InodeRef = Arc<CachedInode>;

/// Exclusive access to an inode's contents
pub type InodeGuard<'a> = tokio::sync::MutexGuard<'a, InodeState>;

struct Slot {
    inode: InodeRef,
    refs: usize,
}

/// Bounded table of referenced inodes
///
/// An inode stays in the table while at least one handle is outstanding,
/// so two lookups of the same number always share one lock.
pub struct InodeCache {
    slots: Mutex<HashMap<u64, Slot>>,
    capacity: usize,
}

impl InodeCache {
    /// Table holding at most `capacity` referenced inodes
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, inum: u64) -> Result<InodeRef> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&inum) {
            slot.refs += 1;
            return Ok(slot.inode.clone());
        }
        if slots.len() >= self.capacity {
            log::warn!("INODE: cache full ({} inodes referenced)", slots.len());
            return Err(Error::InodeCacheFull);
        }

        let inode = Arc::new(CachedInode {
            inum,
            state: tokio::sync::Mutex::new(InodeState {
                inum,
                valid: false,
                disk: DiskInode::default(),
            }),
        });
        slots.insert(inum, Slot { inode: inode.clone(), refs: 1 });
        Ok(inode)
    }

    fn is_last_ref(&self, inum: u64) -> bool {
        self.slots.lock().get(&inum).map(|s| s.refs == 1).unwrap_or(false)
    }

    fn release(&self, inum: u64) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&inum) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&inum);
            }
        }
    }

    /// Number of inodes currently referenced
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no inode is referenced
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Attributes reported by `stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Inode number
    pub inode: u64,
    /// Inode type
    pub kind: InodeKind,
    /// Directory entries referring to the inode
    pub links: u16,
    /// Size in bytes
    pub size: u64,
    /// Permission bits
    pub perm: u32,
    /// Device major number (device nodes only)
    pub major: u16,
    /// Device minor number
    pub minor: u16,
    /// Creation time
    pub ctime: u64,
    /// Last modification time
    pub mtime: u64,
}

impl DiskFs {
    /// Take a reference to inode `inum` without reading it
    pub fn iget(&self, inum: u64) -> Result<InodeRef> {
        if inum == 0 || inum >= self.layout().inode_count {
            return Err(Error::Corrupted(format!("inode number {} out of range", inum)));
        }
        self.icache.get(inum)
    }

    /// Lock an inode, loading it from the inode table if needed
    pub async fn ilock<'a>(&self, ip: &'a CachedInode) -> Result<InodeGuard<'a>> {
        let mut st = ip.state.lock().await;
        if !st.valid {
            let (block, offset) = self.layout().inode_block(ip.inum);
            let mut buf = vec![0u8; BLOCK_SIZE];
            self.read_block(block, &mut buf).await?;
            let disk = DiskInode::from_block(&buf, offset)?;
            if disk.kind == InodeKind::Free {
                return Err(Error::Corrupted(format!("ilock: inode {} has no type", ip.inum)));
            }
            st.disk = disk;
            st.valid = true;
        }
        Ok(st)
    }

    /// Write an inode's in-memory copy back to the inode table
    pub async fn iupdate(&self, st: &InodeState) -> Result<()> {
        let _table = self.itable_lock.lock().await;
        let (block, offset) = self.layout().inode_block(st.inum);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block(block, &mut buf).await?;
        st.disk.store_in_block(&mut buf, offset)?;
        self.write_block(block, &buf)
    }

    /// Drop a reference
    ///
    /// When this was the last reference and no directory entry names the
    /// inode, its blocks are released and the slot is freed on disk.
    pub async fn iput(&self, ip: InodeRef) -> Result<()> {
        let mut result = Ok(());
        if self.icache.is_last_ref(ip.inum) {
            let mut st = ip.state.lock().await;
            // Someone may have taken a reference while we waited for the lock.
            if st.valid && st.disk.links == 0 && self.icache.is_last_ref(ip.inum) {
                log::debug!("INODE: freeing inode {}", ip.inum);
                result = self.free_inode(&mut st).await;
            }
        }
        self.icache.release(ip.inum);
        result
    }

    async fn free_inode(&self, st: &mut InodeState) -> Result<()> {
        self.itrunc(st).await?;
        st.disk = DiskInode::default();
        self.iupdate(st).await?;
        st.valid = false;
        Ok(())
    }

    /// Allocate an unused inode of the given kind
    pub async fn ialloc(&self, kind: InodeKind) -> Result<InodeRef> {
        let inum = {
            let _table = self.itable_lock.lock().await;
            let layout = *self.layout();
            let mut buf = vec![0u8; BLOCK_SIZE];
            let mut found = None;

            'scan: for index in 0..layout.inode_table_blocks {
                let block = layout.inode_table_start + index;
                self.read_block(block, &mut buf).await?;
                for slot in 0..INODES_PER_BLOCK {
                    let inum = index * INODES_PER_BLOCK + slot;
                    if inum == 0 || inum >= layout.inode_count {
                        continue;
                    }
                    let offset = slot as usize * INODE_SIZE;
                    if DiskInode::from_block(&buf, offset)?.kind == InodeKind::Free {
                        DiskInode::new(kind, now_secs()).store_in_block(&mut buf, offset)?;
                        self.write_block(block, &buf)?;
                        found = Some(inum);
                        break 'scan;
                    }
                }
            }
            found.ok_or(Error::NoFreeInodes)?
        };

        log::debug!("INODE: allocated inode {} ({})", inum, kind.as_str());
        self.iget(inum)
    }

    /// Every inode slot in the table, skipping slot 0
    pub async fn scan_inodes(&self) -> Result<Vec<(u64, DiskInode)>> {
        let _table = self.itable_lock.lock().await;
        let layout = *self.layout();
        let mut inodes = Vec::with_capacity(layout.inode_count as usize);
        let mut buf = vec![0u8; BLOCK_SIZE];

        for index in 0..layout.inode_table_blocks {
            self.read_block(layout.inode_table_start + index, &mut buf).await?;
            for slot in 0..INODES_PER_BLOCK {
                let inum = index * INODES_PER_BLOCK + slot;
                if inum == 0 || inum >= layout.inode_count {
                    continue;
                }
                inodes.push((inum, DiskInode::from_block(&buf, slot as usize * INODE_SIZE)?));
            }
        }
        Ok(inodes)
    }

    /// Number of unallocated inode slots
    pub async fn count_free_inodes(&self) -> Result<u64> {
        Ok(self
            .scan_inodes()
            .await?
            .iter()
            .filter(|(_, inode)| inode.kind == InodeKind::Free)
            .count() as u64)
    }

    /// All entries of an indirect block
    pub async fn read_indirect(&self, block: u64) -> Result<Vec<u64>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block(block, &mut buf).await?;
        let mut cursor = Cursor::new(&buf[..]);
        let mut entries = Vec::with_capacity(NINDIRECT);
        for _ in 0..NINDIRECT {
            entries.push(cursor.read_u64::<LittleEndian>()?);
        }
        Ok(entries)
    }

    /// Entry `index` of an indirect block
    pub async fn indirect_entry(&self, block: u64, index: usize) -> Result<u64> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block(block, &mut buf).await?;
        let mut cursor = Cursor::new(&buf[index * 8..index * 8 + 8]);
        Ok(cursor.read_u64::<LittleEndian>()?)
    }

    /// Overwrite entry `index` of an indirect block
    pub async fn set_indirect_entry(&self, block: u64, index: usize, value: u64) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block(block, &mut buf).await?;
        (&mut buf[index * 8..index * 8 + 8]).write_u64::<LittleEndian>(value)?;
        self.write_block(block, &buf)
    }

    /// Physical block for logical block `bn`, or 0 for a hole
    pub async fn lookup_block(&self, st: &InodeState, bn: u64) -> Result<u64> {
        if bn < NDIRECT as u64 {
            return Ok(st.disk.addrs[bn as usize]);
        }
        let index = (bn - NDIRECT as u64) as usize;
        if index >= NINDIRECT {
            return Err(Error::FileTooLarge);
        }
        match st.disk.addrs[NDIRECT] {
            0 => Ok(0),
            indirect => self.indirect_entry(indirect, index).await,
        }
    }

    /// Physical block for logical block `bn`, allocating it if absent
    ///
    /// Newly allocated blocks, the indirect block included, start with one
    /// reference.
    pub async fn bmap(&self, st: &mut InodeState, bn: u64) -> Result<u64> {
        if bn < NDIRECT as u64 {
            let addr = st.disk.addrs[bn as usize];
            if addr != 0 {
                return Ok(addr);
            }
            let block = self.alloc_block()?;
            self.refs.increment(block);
            st.disk.addrs[bn as usize] = block;
            return Ok(block);
        }

        let index = (bn - NDIRECT as u64) as usize;
        if index >= NINDIRECT {
            return Err(Error::FileTooLarge);
        }
        let mut indirect = st.disk.addrs[NDIRECT];
        if indirect == 0 {
            indirect = self.alloc_block()?;
            self.refs.increment(indirect);
            st.disk.addrs[NDIRECT] = indirect;
        }
        let addr = self.indirect_entry(indirect, index).await?;
        if addr != 0 {
            return Ok(addr);
        }
        let block = self.alloc_block()?;
        self.refs.increment(block);
        self.set_indirect_entry(indirect, index, block).await?;
        Ok(block)
    }

    /// Drop every block reference the inode holds and set its size to 0
    ///
    /// Shared blocks survive with one reference fewer; blocks no longer
    /// referenced anywhere are freed.
    pub async fn itrunc(&self, st: &mut InodeState) -> Result<()> {
        for i in 0..NDIRECT {
            let addr = st.disk.addrs[i];
            if addr != 0 {
                self.release_block(addr)?;
                st.disk.addrs[i] = 0;
            }
        }

        let indirect = st.disk.addrs[NDIRECT];
        if indirect != 0 {
            for entry in self.read_indirect(indirect).await? {
                if entry != 0 {
                    self.release_block(entry)?;
                }
            }
            self.release_block(indirect)?;
            st.disk.addrs[NDIRECT] = 0;
        }

        st.disk.size = 0;
        self.iupdate(st).await
    }

    /// Read up to `buf.len()` bytes at `offset`; holes read as zeros
    pub async fn readi(&self, st: &InodeState, buf: &mut [u8], offset: u64) -> Result<usize> {
        if st.disk.kind == InodeKind::Device {
            return Err(Error::Unsupported("read from a device node".to_string()));
        }
        if offset >= st.disk.size {
            return Ok(0);
        }

        let n = buf.len().min((st.disk.size - offset) as usize);
        let mut block_buf = vec![0u8; BLOCK_SIZE];
        let mut done = 0;
        while done < n {
            let pos = offset + done as u64;
            let bn = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (n - done).min(BLOCK_SIZE - block_off);

            match self.lookup_block(st, bn).await? {
                0 => buf[done..done + chunk].fill(0),
                addr => {
                    self.read_block(addr, &mut block_buf).await?;
                    buf[done..done + chunk].copy_from_slice(&block_buf[block_off..block_off + chunk]);
                }
            }
            done += chunk;
        }
        Ok(n)
    }

    /// Write `data` at `offset`, growing the file if needed
    ///
    /// Shared blocks are copied before they are modified. The inode is
    /// written back even when the write fails part way, since blocks may
    /// already have been attached to it.
    pub async fn writei(&self, st: &mut InodeState, data: &[u8], offset: u64) -> Result<usize> {
        if st.disk.kind == InodeKind::Device {
            return Err(Error::Unsupported("write to a device node".to_string()));
        }
        if offset > st.disk.size {
            return Err(Error::InvalidArgument(format!(
                "write offset {} past end of file ({} bytes)",
                offset, st.disk.size
            )));
        }
        let end = offset.checked_add(data.len() as u64).ok_or(Error::FileTooLarge)?;
        if end > MAX_FILE_BLOCKS * BLOCK_SIZE as u64 {
            return Err(Error::FileTooLarge);
        }

        let mut block_buf = vec![0u8; BLOCK_SIZE];
        let mut written = 0;
        let mut result = Ok(());
        while written < data.len() {
            let pos = offset + written as u64;
            let bn = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (data.len() - written).min(BLOCK_SIZE - block_off);

            let wrote = self
                .write_chunk(st, bn, block_off, &data[written..written + chunk], &mut block_buf)
                .await;
            if let Err(e) = wrote {
                result = Err(e);
                break;
            }
            written += chunk;
        }

        let pos = offset + written as u64;
        if pos > st.disk.size {
            st.disk.size = pos;
        }
        if written > 0 {
            st.disk.mtime = now_secs();
        }
        let updated = self.iupdate(st).await;
        result?;
        updated?;
        Ok(written)
    }

    async fn write_chunk(
        &self,
        st: &mut InodeState,
        bn: u64,
        block_off: usize,
        data: &[u8],
        block_buf: &mut [u8],
    ) -> Result<()> {
        // Directories are never shared, so they skip the copy-on-write barrier.
        let shared_ok = st.disk.kind != InodeKind::Directory;
        if shared_ok && bn >= NDIRECT as u64 {
            cow::ensure_unique_indirect(self, st).await?;
        }
        let mut addr = self.bmap(st, bn).await?;
        if shared_ok {
            addr = cow::unshare_data_block(self, st, bn, addr).await?;
        }

        if data.len() == BLOCK_SIZE {
            return self.write_block(addr, data);
        }
        self.read_block(addr, block_buf).await?;
        block_buf[block_off..block_off + data.len()].copy_from_slice(data);
        self.write_block(addr, block_buf)
    }

    /// Attributes of a locked inode
    pub fn stat(&self, st: &InodeState) -> Stat {
        Stat {
            inode: st.inum,
            kind: st.disk.kind,
            links: st.disk.links,
            size: st.disk.size,
            perm: st.disk.perm,
            major: st.disk.major,
            minor: st.disk.minor,
            ctime: st.disk.ctime,
            mtime: st.disk.mtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::config::FsConfig;
    use crate::format::{mkfs, FormatOptions};

    async fn test_fs() -> DiskFs {
        env_logger::builder().is_test(true).try_init().ok();
        let device = Arc::new(MemBlockDevice::new(2048));
        mkfs(device.as_ref(), &FormatOptions::default()).await.unwrap();
        DiskFs::open(device, FsConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_read_with_hole_free_prefix() {
        let fs = test_fs().await;
        fs.begin_op().await;
        let ip = fs.ialloc(InodeKind::File).await.unwrap();
        {
            let mut st = fs.ilock(&ip).await.unwrap();
            st.disk.links = 1;
            let data = b"hello block world".repeat(400);
            assert_eq!(fs.writei(&mut st, &data, 0).await.unwrap(), data.len());
            assert_eq!(st.disk.size, data.len() as u64);

            let mut buf = vec![0u8; data.len() + 100];
            let n = fs.readi(&st, &mut buf, 0).await.unwrap();
            assert_eq!(n, data.len());
            assert_eq!(&buf[..n], &data[..]);
            assert_eq!(fs.readi(&st, &mut buf, st.disk.size).await.unwrap(), 0);
        }
        fs.end_op().await.unwrap();
        fs.begin_op().await;
        fs.iput(ip).await.unwrap();
        fs.end_op().await.unwrap();
    }

    #[tokio::test]
    async fn test_iput_keeps_inode_referenced_while_waiting() {
        let fs = test_fs().await;
        let free = fs.count_free_inodes().await.unwrap();

        fs.begin_op().await;
        let ip = fs.ialloc(InodeKind::File).await.unwrap();
        let inum = ip.inum();
        let handle = ip.clone();
        let guard = fs.ilock(&handle).await.unwrap();
        assert_eq!(guard.disk.links, 0);

        let put = fs.iput(ip);
        tokio::pin!(put);
        assert!(futures::poll!(&mut put).is_pending());

        // A second holder arrives before the first release gets the lock.
        let second = fs.iget(inum).unwrap();
        drop(guard);
        put.await.unwrap();

        assert_eq!(fs.ilock(&second).await.unwrap().kind(), InodeKind::File);
        assert_eq!(fs.count_free_inodes().await.unwrap(), free - 1);
        fs.iput(second).await.unwrap();
        fs.end_op().await.unwrap();
        assert_eq!(fs.count_free_inodes().await.unwrap(), free);
    }

    #[tokio::test]
    async fn test_indirect_blocks_are_counted_and_released() {
        let fs = test_fs().await;
        let free_before = fs.free_blocks();

        fs.begin_op().await;
        let ip = fs.ialloc(InodeKind::File).await.unwrap();
        let mut st = fs.ilock(&ip).await.unwrap();
        let data = vec![0xabu8; (NDIRECT + 2) * BLOCK_SIZE];
        fs.writei(&mut st, &data, 0).await.unwrap();
        let indirect = st.disk.addrs[NDIRECT];
        assert_ne!(indirect, 0);
        assert_eq!(fs.refs().get(indirect), 1);
        assert_eq!(fs.lookup_block(&st, NDIRECT as u64 + 2).await.unwrap(), 0);
        // Twelve data blocks plus the indirect block.
        assert_eq!(fs.free_blocks(), free_before - 13);
        fs.end_op().await.unwrap();

        fs.begin_op().await;
        fs.itrunc(&mut st).await.unwrap();
        fs.end_op().await.unwrap();
        assert_eq!(st.disk.size, 0);
        assert_eq!(fs.free_blocks(), free_before);
        assert_eq!(fs.refs().get(indirect), 0);
    }

    #[tokio::test]
    async fn test_iput_frees_unlinked_inode() {
        let fs = test_fs().await;
        let free_inodes = fs.count_free_inodes().await.unwrap();

        fs.begin_op().await;
        let ip = fs.ialloc(InodeKind::File).await.unwrap();
        {
            let mut st = fs.ilock(&ip).await.unwrap();
            fs.writei(&mut st, b"scratch", 0).await.unwrap();
        }
        assert_eq!(fs.count_free_inodes().await.unwrap(), free_inodes - 1);
        fs.iput(ip).await.unwrap();
        fs.end_op().await.unwrap();

        assert_eq!(fs.count_free_inodes().await.unwrap(), free_inodes);
        assert!(fs.icache.is_empty());
    }

    #[tokio::test]
    async fn test_write_bounds() {
        let fs = test_fs().await;
        fs.begin_op().await;
        let ip = fs.ialloc(InodeKind::File).await.unwrap();
        {
            let mut st = fs.ilock(&ip).await.unwrap();
            st.disk.links = 1;
            assert!(matches!(
                fs.writei(&mut st, b"x", 10).await,
                Err(Error::InvalidArgument(_))
            ));
            st.disk.size = MAX_FILE_BLOCKS * BLOCK_SIZE as u64;
            let off = st.disk.size;
            assert!(matches!(
                fs.writei(&mut st, b"x", off).await,
                Err(Error::FileTooLarge)
            ));
            st.disk.size = 0;
            fs.iupdate(&st).await.unwrap();
        }
        fs.iput(ip).await.unwrap();
        fs.end_op().await.unwrap();
    }

    #[tokio::test]
    async fn test_inode_cache_capacity() {
        let cache = InodeCache::new(2);
        let a = cache.get(1).unwrap();
        let again = cache.get(1).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        let _b = cache.get(2).unwrap();
        assert!(matches!(cache.get(3), Err(Error::InodeCacheFull)));

        cache.release(1);
        cache.release(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(3).is_ok());
    }

    #[tokio::test]
    async fn test_ilock_rejects_free_inode() {
        let fs = test_fs().await;
        let ip = fs.iget(5).unwrap();
        assert!(matches!(fs.ilock(&ip).await, Err(Error::Corrupted(_))));
        fs.iput(ip).await.unwrap();
        assert!(matches!(fs.iget(0), Err(Error::Corrupted(_))));
    }
}
