//! Path-level filesystem interface
//!
//! [`Vfs`] is what applications talk to. Every call that changes the tree
//! runs as one journaled operation (large writes as several) and passes its
//! target paths through the snapshot guard first.

use std::sync::Arc;

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::config::FsConfig;
use crate::error::{Error, Result};
use crate::format::{mkfs, FormatOptions, InodeKind, NDIRECT};
use crate::inode::{InodeRef, Stat};
use crate::layout::DiskFs;
use crate::modules::scrub::{self, ScrubReport};
use crate::modules::snapshot::{SnapshotManager, SnapshotMetadata, SnapshotStats};

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Allow reads
    pub read: bool,
    /// Allow writes
    pub write: bool,
    /// Create the file if it does not exist
    pub create: bool,
    /// Truncate a regular file to zero length
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only access
    pub const READ_ONLY: Self = Self { read: true, write: false, create: false, truncate: false };
    /// Write-only access
    pub const WRITE_ONLY: Self = Self { read: false, write: true, create: false, truncate: false };
    /// Read and write access
    pub const READ_WRITE: Self = Self { read: true, write: true, create: false, truncate: false };

    /// Also create the file
    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }

    /// Also truncate the file
    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    fn modifies(&self) -> bool {
        self.write || self.create || self.truncate
    }
}

/// An open file
///
/// Must be handed back through [`Vfs::close`] to drop its inode reference.
#[derive(Debug)]
pub struct File {
    inode: InodeRef,
    offset: u64,
    readable: bool,
    writable: bool,
}

impl File {
    /// Inode number of the open file
    pub fn inode(&self) -> u64 {
        self.inode.inum()
    }

    /// Current position
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move the position; writes may not start past the end of the file
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }
}

/// One entry returned by [`Vfs::read_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    /// Entry name
    pub name: String,
    /// Inode number
    pub inode: u64,
    /// Inode type, if the entry records a known one
    pub kind: Option<InodeKind>,
}

/// Where one block of a file lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapping {
    /// Logical block index, `None` for the indirect block
    pub logical: Option<u64>,
    /// Physical block number
    pub physical: u64,
    /// Current reference count
    pub refs: u32,
}

/// A mounted filesystem with snapshot support
pub struct Vfs {
    fs: Arc<DiskFs>,
    snapshots: SnapshotManager,
}

impl Vfs {
    /// Format `device` and mount the fresh filesystem
    pub async fn format(
        device: Arc<dyn BlockDevice>,
        options: &FormatOptions,
        config: FsConfig,
    ) -> Result<Self> {
        mkfs(device.as_ref(), options).await?;
        Self::mount(device, config).await
    }

    /// Mount an existing filesystem
    pub async fn mount(device: Arc<dyn BlockDevice>, config: FsConfig) -> Result<Self> {
        let snapshot_config = config.snapshot.clone();
        let fs = Arc::new(DiskFs::open(device, config).await?);
        let snapshots = SnapshotManager::new(Arc::clone(&fs), snapshot_config);
        Ok(Self { fs, snapshots })
    }

    /// Flush and close the device
    pub async fn shutdown(&self) -> Result<()> {
        self.fs.shutdown().await
    }

    /// The underlying inode-level filesystem
    pub fn fs(&self) -> &Arc<DiskFs> {
        &self.fs
    }

    /// The snapshot manager
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Open `path`
    ///
    /// Opening a directory for writing is [`Error::IsADirectory`]; opening
    /// for writing anywhere under the snapshot namespace is
    /// [`Error::SnapshotReadOnly`].
    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<File> {
        if !flags.read && !flags.write {
            return Err(Error::InvalidArgument("open: neither read nor write requested".into()));
        }
        if flags.modifies() {
            self.snapshots.check_writable(path).await?;
        }

        let fs = self.fs.as_ref();
        let inode = fs
            .run_op(|| async move {
                let ip = if flags.create {
                    fs.create(path, InodeKind::File, 0, 0).await?
                } else {
                    fs.namei(path).await?
                };
                let prepared = async {
                    let mut st = fs.ilock(&ip).await?;
                    if st.is_dir() && flags.modifies() {
                        return Err(Error::IsADirectory);
                    }
                    if flags.truncate && st.kind() == InodeKind::File {
                        fs.itrunc(&mut st).await?;
                    }
                    Ok::<(), Error>(())
                }
                .await;
                if let Err(e) = prepared {
                    fs.iput(ip).await?;
                    return Err(e);
                }
                Ok(ip)
            })
            .await?;

        Ok(File {
            inode,
            offset: 0,
            readable: flags.read,
            writable: flags.write,
        })
    }

    /// Read from the current position, returning the byte count (0 at end)
    pub async fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        if !file.readable {
            return Err(Error::PermissionDenied);
        }
        let st = self.fs.ilock(&file.inode).await?;
        let n = self.fs.readi(&st, buf, file.offset).await?;
        file.offset += n as u64;
        Ok(n)
    }

    /// Write at the current position
    ///
    /// The data goes out in pieces small enough for one journal operation
    /// each, so a crash may leave a prefix of it written.
    pub async fn write(&self, file: &mut File, data: &[u8]) -> Result<usize> {
        if !file.writable {
            return Err(Error::PermissionDenied);
        }
        let fs = self.fs.as_ref();
        let mut written = 0;
        for chunk in data.chunks(fs.max_write_bytes()) {
            let offset = file.offset;
            let ip = &file.inode;
            let n = fs
                .run_op(|| async move {
                    let mut st = fs.ilock(ip).await?;
                    fs.writei(&mut st, chunk, offset).await
                })
                .await?;
            file.offset += n as u64;
            written += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(written)
    }

    /// Close a file
    pub async fn close(&self, file: File) -> Result<()> {
        let fs = self.fs.as_ref();
        let ip = file.inode;
        fs.run_op(|| async move { fs.iput(ip).await }).await
    }

    /// Create or truncate `path` and fill it with `data`
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self
            .open(path, OpenFlags::WRITE_ONLY.create().truncate())
            .await?;
        let result = self.write(&mut file, data).await;
        self.close(file).await?;
        let written = result?;
        if written < data.len() {
            return Err(Error::FileTooLarge);
        }
        Ok(())
    }

    /// Read the whole of `path`
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, OpenFlags::READ_ONLY).await?;
        let mut data = Vec::new();
        let mut buf = vec![0u8; BLOCK_SIZE * 4];
        let result = loop {
            match self.read(&mut file, &mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) => break Err(e),
            }
        };
        self.close(file).await?;
        result.map(|_| data)
    }

    async fn create_node(&self, path: &str, kind: InodeKind, major: u16, minor: u16) -> Result<()> {
        self.snapshots.check_writable(path).await?;
        let fs = self.fs.as_ref();
        fs.run_op(|| async move {
            let ip = fs.create(path, kind, major, minor).await?;
            fs.iput(ip).await
        })
        .await
    }

    /// Create a directory
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.create_node(path, InodeKind::Directory, 0, 0).await
    }

    /// Create a device node
    pub async fn mknod(&self, path: &str, major: u16, minor: u16) -> Result<()> {
        self.create_node(path, InodeKind::Device, major, minor).await
    }

    /// Add a hard link `new` to the file at `old`
    pub async fn link(&self, old: &str, new: &str) -> Result<()> {
        self.snapshots.check_writable(old).await?;
        self.snapshots.check_writable(new).await?;
        let fs = self.fs.as_ref();
        fs.run_op(|| async move { fs.link(old, new).await }).await
    }

    /// Remove a directory entry
    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.snapshots.check_writable(path).await?;
        let fs = self.fs.as_ref();
        fs.run_op(|| async move { fs.unlink(path).await }).await
    }

    /// Attributes of `path`
    pub async fn stat(&self, path: &str) -> Result<Stat> {
        let fs = self.fs.as_ref();
        fs.run_op(|| async move {
            let ip = fs.namei(path).await?;
            let stat = fs.ilock(&ip).await.map(|st| fs.stat(&st));
            fs.iput(ip).await?;
            stat
        })
        .await
    }

    /// Entries of the directory at `path`, "." and ".." included
    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntryInfo>> {
        let fs = self.fs.as_ref();
        fs.run_op(|| async move {
            let ip = fs.namei(path).await?;
            let entries = async {
                let st = fs.ilock(&ip).await?;
                if !st.is_dir() {
                    return Err(Error::NotADirectory);
                }
                fs.dir_entries(&st, usize::MAX).await
            }
            .await;
            fs.iput(ip).await?;
            Ok(entries?
                .into_iter()
                .map(|e| DirEntryInfo {
                    kind: e.kind(),
                    inode: e.inode,
                    name: e.name,
                })
                .collect())
        })
        .await
    }

    /// Physical placement and reference count of every block of `path`
    pub async fn block_addrs(&self, path: &str) -> Result<Vec<BlockMapping>> {
        let fs = self.fs.as_ref();
        fs.run_op(|| async move {
            let ip = fs.namei(path).await?;
            let mappings = async {
                let st = fs.ilock(&ip).await?;
                let mut mappings = Vec::new();
                let blocks = st.disk.size.div_ceil(BLOCK_SIZE as u64);
                for bn in 0..blocks {
                    let physical = fs.lookup_block(&st, bn).await?;
                    if physical != 0 {
                        mappings.push(BlockMapping {
                            logical: Some(bn),
                            physical,
                            refs: fs.refs().get(physical),
                        });
                    }
                }
                let indirect = st.disk.addrs[NDIRECT];
                if indirect != 0 {
                    mappings.push(BlockMapping {
                        logical: None,
                        physical: indirect,
                        refs: fs.refs().get(indirect),
                    });
                }
                Ok::<_, Error>(mappings)
            }
            .await;
            fs.iput(ip).await?;
            mappings
        })
        .await
    }

    /// Reference count of a physical block
    pub fn block_refcount(&self, block: u64) -> u32 {
        self.fs.refs().get(block)
    }

    /// Number of unallocated inodes
    pub async fn free_inodes(&self) -> Result<u64> {
        self.fs.count_free_inodes().await
    }

    /// Number of free data blocks
    pub fn free_blocks(&self) -> u64 {
        self.fs.free_blocks()
    }

    /// Snapshot the live tree, returning the new id
    pub async fn snapshot_create(&self) -> Result<u32> {
        self.snapshots.create_snapshot().await
    }

    /// Delete snapshot `id`
    pub async fn snapshot_delete(&self, id: u32) -> Result<()> {
        self.snapshots.delete_snapshot(id).await
    }

    /// Replace the live tree with snapshot `id`
    pub async fn snapshot_rollback(&self, id: u32) -> Result<()> {
        self.snapshots.rollback_to_snapshot(id).await
    }

    /// Existing snapshots in id order
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        self.snapshots.list_snapshots().await
    }

    /// Snapshot and sharing statistics
    pub async fn snapshot_stats(&self) -> Result<SnapshotStats> {
        self.snapshots.get_snapshot_stats().await
    }

    /// Check reference counts against the inode table
    ///
    /// Snapshot operations are held off while the scrub runs.
    pub async fn scrub(&self, repair: bool) -> Result<ScrubReport> {
        let _op = self.snapshots.exclusive().await;
        scrub::scrub(&self.fs, repair).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use rand::RngCore;

    async fn test_vfs() -> Vfs {
        env_logger::builder().is_test(true).try_init().ok();
        let device = Arc::new(MemBlockDevice::new(4096));
        Vfs::format(device, &FormatOptions::default(), FsConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_read_write() {
        let vfs = test_vfs().await;
        let mut file = vfs
            .open("/notes", OpenFlags::READ_WRITE.create())
            .await
            .unwrap();
        assert_eq!(vfs.write(&mut file, b"hello ").await.unwrap(), 6);
        assert_eq!(vfs.write(&mut file, b"world").await.unwrap(), 5);
        file.seek(6);
        let mut buf = [0u8; 16];
        let n = vfs.read(&mut file, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        vfs.close(file).await.unwrap();

        assert_eq!(vfs.read_file("/notes").await.unwrap(), b"hello world");
        assert_eq!(vfs.stat("/notes").await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_open_flags_enforced() {
        let vfs = test_vfs().await;
        vfs.write_file("/f", b"abc").await.unwrap();

        let mut file = vfs.open("/f", OpenFlags::READ_ONLY).await.unwrap();
        assert!(matches!(vfs.write(&mut file, b"x").await, Err(Error::PermissionDenied)));
        vfs.close(file).await.unwrap();

        let mut file = vfs.open("/f", OpenFlags::WRITE_ONLY).await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(vfs.read(&mut file, &mut buf).await, Err(Error::PermissionDenied)));
        vfs.close(file).await.unwrap();

        assert!(matches!(
            vfs.open("/", OpenFlags::WRITE_ONLY).await,
            Err(Error::IsADirectory)
        ));
        assert!(matches!(
            vfs.open("/missing", OpenFlags::READ_ONLY).await,
            Err(Error::NotFound(_))
        ));

        let file = vfs.open("/f", OpenFlags::WRITE_ONLY.truncate()).await.unwrap();
        vfs.close(file).await.unwrap();
        assert_eq!(vfs.stat("/f").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_large_write_spans_operations() {
        let vfs = test_vfs().await;
        let mut data = vec![0u8; vfs.fs().max_write_bytes() * 3 + 1234];
        rand::thread_rng().fill_bytes(&mut data);

        vfs.write_file("/big", &data).await.unwrap();
        assert_eq!(vfs.read_file("/big").await.unwrap(), data);

        let addrs = vfs.block_addrs("/big").await.unwrap();
        let data_blocks = data.len().div_ceil(BLOCK_SIZE);
        assert_eq!(addrs.len(), data_blocks + 1);
        assert!(addrs.iter().all(|m| m.refs == 1));
        assert_eq!(addrs.last().unwrap().logical, None);
    }

    #[tokio::test]
    async fn test_namespace_operations() {
        let vfs = test_vfs().await;
        vfs.mkdir("/d").await.unwrap();
        vfs.write_file("/d/a", b"1").await.unwrap();
        vfs.link("/d/a", "/d/b").await.unwrap();
        vfs.mknod("/console", 1, 1).await.unwrap();

        assert!(matches!(vfs.mkdir("/d").await, Err(Error::AlreadyExists(_))));
        assert!(matches!(vfs.mknod("/console", 1, 1).await, Err(Error::AlreadyExists(_))));

        let mut names: Vec<String> = vfs
            .read_dir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec![".", "..", "a", "b"]);
        assert_eq!(vfs.stat("/d/a").await.unwrap().links, 2);
        assert_eq!(vfs.stat("/console").await.unwrap().kind, InodeKind::Device);
        assert!(matches!(vfs.read_dir("/d/a").await, Err(Error::NotADirectory)));

        vfs.unlink("/d/a").await.unwrap();
        assert_eq!(vfs.read_file("/d/b").await.unwrap(), b"1");
        assert!(matches!(vfs.unlink("/d").await, Err(Error::DirectoryNotEmpty)));
    }

    #[tokio::test]
    async fn test_snapshot_namespace_is_read_only() {
        let vfs = test_vfs().await;
        vfs.mkdir("/dir").await.unwrap();
        vfs.write_file("/dir/f", b"live").await.unwrap();
        assert_eq!(vfs.snapshot_create().await.unwrap(), 1);

        let readonly = |r: Result<()>| matches!(r, Err(Error::SnapshotReadOnly(_)));
        assert!(readonly(vfs.write_file("/snapshot/01/dir/f", b"x").await));
        assert!(readonly(vfs.write_file("/snapshot/01/new", b"x").await));
        assert!(readonly(vfs.mkdir("/snapshot/01/d").await));
        assert!(readonly(vfs.mknod("/snapshot/01/dev", 1, 1).await));
        assert!(readonly(vfs.unlink("/snapshot/01/dir/f").await));
        assert!(readonly(vfs.link("/snapshot/01/dir/f", "/stolen").await));
        assert!(readonly(vfs.link("/dir/f", "/snapshot/01/dir/g").await));
        assert!(readonly(vfs.unlink("/dir/../snapshot/01").await));
        assert!(matches!(
            vfs.open("/snapshot/01/dir/f", OpenFlags::READ_WRITE).await,
            Err(Error::SnapshotReadOnly(_))
        ));

        assert_eq!(vfs.read_file("/snapshot/01/dir/f").await.unwrap(), b"live");
        let shared = vfs.block_addrs("/dir/f").await.unwrap();
        assert_eq!(shared[0].refs, 2);
    }

    #[tokio::test]
    async fn test_scrub_after_operations() {
        let vfs = test_vfs().await;
        vfs.write_file("/a", &vec![3u8; BLOCK_SIZE * 12]).await.unwrap();
        vfs.snapshot_create().await.unwrap();
        vfs.write_file("/a", b"short").await.unwrap();
        vfs.snapshot_delete(1).await.unwrap();

        let report = vfs.scrub(false).await.unwrap();
        assert!(report.is_clean(), "{:?}", report);
    }
}
