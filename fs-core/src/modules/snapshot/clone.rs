//! Inode cloning
//!
//! A clone copies metadata and aliases every block pointer of the source,
//! bumping each block's reference count. No file data is copied; later
//! writes to either side go through the copy-on-write barrier.

use crate::error::{Error, Result};
use crate::format::NDIRECT;
use crate::inode::InodeState;
use crate::layout::DiskFs;

/// Make `dst` a copy-on-write sibling of `src`
///
/// Both inodes must be locked by the caller. Any blocks `dst` already holds
/// are released first. Directories are rebuilt entry by entry instead and
/// are rejected here.
pub async fn clone_inode(fs: &DiskFs, src: &InodeState, dst: &mut InodeState) -> Result<()> {
    if src.is_dir() || dst.is_dir() {
        return Err(Error::IsADirectory);
    }

    if dst.disk.size > 0 || dst.disk.addrs.iter().any(|&a| a != 0) {
        fs.itrunc(dst).await?;
    }

    dst.disk.kind = src.disk.kind;
    dst.disk.major = src.disk.major;
    dst.disk.minor = src.disk.minor;
    dst.disk.perm = src.disk.perm;
    dst.disk.size = src.disk.size;
    dst.disk.mtime = src.disk.mtime;
    dst.disk.addrs = src.disk.addrs;

    for &addr in &src.disk.addrs[..NDIRECT] {
        if addr != 0 {
            fs.refs.increment(addr);
        }
    }
    let indirect = src.disk.addrs[NDIRECT];
    if indirect != 0 {
        fs.refs.increment(indirect);
        for entry in fs.read_indirect(indirect).await? {
            if entry != 0 {
                fs.refs.increment(entry);
            }
        }
    }

    log::debug!(
        "CLONE: inode {} -> {} ({} bytes)",
        src.inum(),
        dst.inum(),
        dst.disk.size
    );
    fs.iupdate(dst).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{MemBlockDevice, BLOCK_SIZE};
    use crate::config::FsConfig;
    use crate::format::{mkfs, FormatOptions, InodeKind, ROOT_INODE};
    use std::sync::Arc;

    async fn test_fs() -> DiskFs {
        env_logger::builder().is_test(true).try_init().ok();
        let device = Arc::new(MemBlockDevice::new(2048));
        mkfs(device.as_ref(), &FormatOptions::default()).await.unwrap();
        DiskFs::open(device, FsConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_clone_aliases_blocks_without_copying() {
        let fs = test_fs().await;
        let data = vec![3u8; (NDIRECT + 3) * BLOCK_SIZE];

        fs.begin_op().await;
        let a = fs.ialloc(InodeKind::File).await.unwrap();
        let b = fs.ialloc(InodeKind::File).await.unwrap();
        let mut sa = fs.ilock(&a).await.unwrap();
        let mut sb = fs.ilock(&b).await.unwrap();
        fs.writei(&mut sa, &data, 0).await.unwrap();
        let free_before = fs.free_blocks();

        clone_inode(&fs, &sa, &mut sb).await.unwrap();
        fs.end_op().await.unwrap();

        assert_eq!(fs.free_blocks(), free_before);
        assert_eq!(sb.disk.addrs, sa.disk.addrs);
        assert_eq!(sb.disk.size, sa.disk.size);
        for entry in fs.read_indirect(sa.disk.addrs[NDIRECT]).await.unwrap() {
            if entry != 0 {
                assert_eq!(fs.refs().get(entry), 2);
            }
        }
        assert_eq!(fs.refs().get(sa.disk.addrs[NDIRECT]), 2);
        assert_eq!(fs.refs().shared_blocks(), NDIRECT + 3 + 1);
    }

    #[tokio::test]
    async fn test_clone_over_existing_releases_old_blocks() {
        let fs = test_fs().await;
        fs.begin_op().await;
        let a = fs.ialloc(InodeKind::File).await.unwrap();
        let b = fs.ialloc(InodeKind::File).await.unwrap();
        let mut sa = fs.ilock(&a).await.unwrap();
        let mut sb = fs.ilock(&b).await.unwrap();
        fs.writei(&mut sa, b"source", 0).await.unwrap();
        fs.writei(&mut sb, b"old destination", 0).await.unwrap();
        let old = sb.disk.addrs[0];

        clone_inode(&fs, &sa, &mut sb).await.unwrap();
        fs.end_op().await.unwrap();

        assert!(!fs.is_block_allocated(old));
        assert_eq!(fs.refs().get(old), 0);
        let mut buf = vec![0u8; 32];
        let n = fs.readi(&sb, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"source");
    }

    #[tokio::test]
    async fn test_clone_rejects_directories() {
        let fs = test_fs().await;
        fs.begin_op().await;
        let root = fs.iget(ROOT_INODE).unwrap();
        let f = fs.ialloc(InodeKind::File).await.unwrap();
        {
            let sroot = fs.ilock(&root).await.unwrap();
            let mut sf = fs.ilock(&f).await.unwrap();
            assert!(matches!(
                clone_inode(&fs, &sroot, &mut sf).await,
                Err(Error::IsADirectory)
            ));
        }
        fs.end_op().await.unwrap();
    }
}
