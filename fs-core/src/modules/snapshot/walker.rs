//! Directory tree traversal for snapshot and restore
//!
//! Every walk follows the same protocol: lock a directory, copy its entries
//! into a bounded list, unlock it, then act on the list. At most one
//! directory lock is held at a time, and only a source/destination pair of
//! file locks while a single file is cloned.

use futures::future::{BoxFuture, FutureExt};

use crate::error::{Error, Result};
use crate::format::{DirEntry, InodeKind, ROOT_INODE};
use crate::inode::InodeRef;
use crate::layout::DiskFs;
use crate::modules::snapshot::clone::clone_inode;

/// What a clone walk is building
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// A fresh snapshot tree; any existing destination entry is an error
    /// and the walk stops at the first failure
    Snapshot,
    /// The live tree, rebuilt from a snapshot; existing directories are
    /// reused, existing files are cloned over, and siblings of a failed
    /// entry are still attempted
    Restore,
}

/// Non-structural entries of directory `dir`, read under its lock
///
/// `skip` names an entry of the root directory to leave out.
pub(crate) async fn collect_children(
    fs: &DiskFs,
    dir: u64,
    limit: usize,
    skip: Option<&str>,
) -> Result<Vec<DirEntry>> {
    let entries = fs
        .run_op(|| async move {
            let dp = fs.iget(dir)?;
            let listed = async {
                let st = fs.ilock(&dp).await?;
                fs.dir_entries(&st, limit).await
            }
            .await;
            let put = fs.iput(dp).await;
            let entries = listed?;
            put?;
            Ok(entries)
        })
        .await?;

    Ok(entries
        .into_iter()
        .filter(|e| !e.is_structural())
        .filter(|e| !(dir == ROOT_INODE && Some(e.name.as_str()) == skip))
        .collect())
}

/// Create directory `name` under `parent` within the caller's operation
pub(crate) async fn make_dir(fs: &DiskFs, parent: u64, name: &str) -> Result<u64> {
    let ip = create_entry(fs, parent, name, InodeKind::Directory).await?;
    let inum = ip.inum();
    fs.iput(ip).await?;
    Ok(inum)
}

async fn create_entry(fs: &DiskFs, parent: u64, name: &str, kind: InodeKind) -> Result<InodeRef> {
    let dp = fs.iget(parent)?;
    let created = async {
        let mut st = fs.ilock(&dp).await?;
        fs.create_child(&mut st, name, kind, 0, 0).await
    }
    .await;
    let put = fs.iput(dp).await;
    let ip = created?;
    if let Err(e) = put {
        fs.iput(ip).await.ok();
        return Err(e);
    }
    Ok(ip)
}

/// Recursive clone of one directory tree onto another
pub(crate) struct TreeWalker<'a> {
    fs: &'a DiskFs,
    namespace: &'a str,
    limit: usize,
}

impl<'a> TreeWalker<'a> {
    /// Walker that skips `namespace` under the root and reads at most
    /// `limit` entries per directory
    pub(crate) fn new(fs: &'a DiskFs, namespace: &'a str, limit: usize) -> Self {
        Self { fs, namespace, limit }
    }

    /// Entries of `dir`, without the snapshot namespace
    pub(crate) async fn children(&self, dir: u64) -> Result<Vec<DirEntry>> {
        collect_children(self.fs, dir, self.limit, Some(self.namespace)).await
    }

    /// Inodes a clone of the tree under `dir` would allocate
    ///
    /// Device nodes are not cloned and are not counted.
    pub(crate) fn count_needed(&self, dir: u64) -> BoxFuture<'_, Result<u64>> {
        async move {
            let mut needed = 0;
            for entry in self.children(dir).await? {
                match entry.kind() {
                    Some(InodeKind::Directory) => needed += 1 + self.count_needed(entry.inode).await?,
                    Some(InodeKind::File) => needed += 1,
                    _ => {}
                }
            }
            Ok(needed)
        }
        .boxed()
    }

    /// Mirror the tree under directory `src` into directory `dst`
    pub(crate) fn clone_dir(&self, src: u64, dst: u64, mode: WalkMode) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut first_err = None;
            for entry in self.children(src).await? {
                let result = match entry.kind() {
                    Some(InodeKind::Directory) => self.clone_subdir(&entry, dst, mode).await,
                    Some(InodeKind::File) => self.clone_file(&entry, dst, mode).await,
                    _ => {
                        log::debug!("WALKER: skipping device node '{}'", entry.name);
                        Ok(())
                    }
                };

                if let Err(e) = result {
                    if mode == WalkMode::Snapshot || e.is_fatal() {
                        return Err(e);
                    }
                    log::warn!("WALKER: restoring '{}' failed: {}", entry.name, e);
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        }
        .boxed()
    }

    async fn clone_subdir(&self, entry: &DirEntry, dst: u64, mode: WalkMode) -> Result<()> {
        let child = self.ensure_dir(dst, &entry.name, mode).await?;
        self.clone_dir(entry.inode, child, mode).await
    }

    /// Destination directory for `name`, created in its own operation
    async fn ensure_dir(&self, parent: u64, name: &str, mode: WalkMode) -> Result<u64> {
        let fs = self.fs;
        fs.run_op(|| async move {
            if let Some(existing) = fs.lookup_child(parent, name).await? {
                return match (mode, existing.kind()) {
                    (WalkMode::Restore, Some(InodeKind::Directory)) => Ok(existing.inode),
                    _ => Err(Error::AlreadyExists(name.to_string())),
                };
            }
            make_dir(fs, parent, name).await
        })
        .await
    }

    /// Clone one file into directory `dst` as a single operation
    async fn clone_file(&self, entry: &DirEntry, dst: u64, mode: WalkMode) -> Result<()> {
        let fs = self.fs;
        fs.run_op(|| async move {
            let target = match fs.lookup_child(dst, &entry.name).await? {
                Some(existing) if mode == WalkMode::Restore && existing.kind() == Some(InodeKind::File) => {
                    fs.iget(existing.inode)?
                }
                Some(_) => return Err(Error::AlreadyExists(entry.name.clone())),
                None => create_entry(fs, dst, &entry.name, InodeKind::File).await?,
            };
            let source = match fs.iget(entry.inode) {
                Ok(ip) => ip,
                Err(e) => {
                    fs.iput(target).await.ok();
                    return Err(e);
                }
            };

            let cloned = async {
                let src_st = fs.ilock(&source).await?;
                let mut dst_st = fs.ilock(&target).await?;
                clone_inode(fs, &src_st, &mut dst_st).await
            }
            .await;
            let put_source = fs.iput(source).await;
            let put_target = fs.iput(target).await;
            cloned?;
            put_source?;
            put_target
        })
        .await
    }
}
