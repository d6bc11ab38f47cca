//! Snapshot module for SnapFS
//!
//! Snapshots are read-only, copy-on-write copies of the whole live tree kept
//! under a namespace directory at the root (`/snapshot/01`, `/snapshot/02`,
//! ...). The directory is the snapshot: there is no other on-disk record.
//! Files in a snapshot share data blocks with the live tree until one side
//! is written, tracked by the block reference table in [`refcount`].

pub mod clone;
pub(crate) mod cow;
pub(crate) mod delete;
pub mod guard;
pub mod refcount;
pub(crate) mod restore;
pub mod walker;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::format::{InodeKind, ROOT_INODE};
use crate::layout::DiskFs;
use delete::delete_tree;
use walker::{collect_children, make_dir, TreeWalker, WalkMode};

/// Highest id a two-digit snapshot name can carry
const MAX_SNAPSHOT_ID: u32 = 99;

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Name of the namespace directory under the root
    pub namespace: String,
    /// Highest snapshot id handed out (at most 99)
    pub max_snapshots: u32,
    /// Largest directory the tree walkers will read
    pub max_dir_entries: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            namespace: "snapshot".to_string(),
            max_snapshots: MAX_SNAPSHOT_ID,
            max_dir_entries: 512,
        }
    }
}

/// Snapshot metadata, derived from the snapshot's root directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Snapshot id
    pub id: u32,
    /// Absolute path of the snapshot root
    pub path: String,
    /// Inode number of the snapshot root
    pub root_inode: u64,
    /// Creation timestamp
    pub created_at: u64,
}

/// Snapshot and sharing statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStats {
    /// Number of snapshots present
    pub total_snapshots: usize,
    /// Ids still available
    pub free_ids: usize,
    /// Blocks referenced more than once
    pub shared_blocks: usize,
    /// Blocks referenced at least once
    pub referenced_blocks: usize,
    /// Unallocated inodes
    pub free_inodes: u64,
    /// Unallocated data blocks
    pub free_blocks: u64,
}

/// Snapshot manager for handling filesystem snapshots
///
/// Create, delete and rollback are serialized by one operation-wide lock;
/// the admission check of a create is only meaningful if no other
/// snapshot mutation runs between it and the walk.
pub struct SnapshotManager {
    fs: Arc<DiskFs>,
    config: SnapshotConfig,
    op_lock: tokio::sync::Mutex<()>,
}

impl SnapshotManager {
    /// Create a new snapshot manager
    pub fn new(fs: Arc<DiskFs>, mut config: SnapshotConfig) -> Self {
        if config.max_snapshots == 0 || config.max_snapshots > MAX_SNAPSHOT_ID {
            log::warn!(
                "SNAPSHOT: max_snapshots {} outside 1..={}, clamping",
                config.max_snapshots,
                MAX_SNAPSHOT_ID
            );
            config.max_snapshots = config.max_snapshots.clamp(1, MAX_SNAPSHOT_ID);
        }
        Self {
            fs,
            config,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Directory name of snapshot `id`
    pub fn snapshot_name(id: u32) -> String {
        format!("{:02}", id)
    }

    /// Hold the snapshot operation lock, keeping snapshot mutations out
    pub(crate) async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    fn walker(&self) -> TreeWalker<'_> {
        TreeWalker::new(&self.fs, &self.config.namespace, self.config.max_dir_entries)
    }

    async fn namespace_inode(&self) -> Result<Option<u64>> {
        let fs = self.fs.as_ref();
        let namespace = self.config.namespace.as_str();
        Ok(fs
            .run_op(|| async move { fs.lookup_child(ROOT_INODE, namespace).await })
            .await?
            .map(|e| e.inode))
    }

    /// Ids present in the namespace, with their root inodes, in id order
    async fn existing(&self, ns: u64) -> Result<Vec<(u32, u64)>> {
        let mut ids: Vec<(u32, u64)> = collect_children(&self.fs, ns, self.config.max_dir_entries, None)
            .await?
            .into_iter()
            .filter(|e| e.kind() == Some(InodeKind::Directory) && e.name.len() == 2)
            .filter_map(|e| e.name.parse::<u32>().ok().map(|id| (id, e.inode)))
            .filter(|(id, _)| (1..=MAX_SNAPSHOT_ID).contains(id))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Namespace inode and snapshot root inode of `id`
    async fn resolve(&self, id: u32) -> Result<(u64, u64)> {
        let not_found = || Error::NotFound(format!("snapshot {}", id));
        if id == 0 || id > MAX_SNAPSHOT_ID {
            return Err(not_found());
        }
        let ns = self.namespace_inode().await?.ok_or_else(not_found)?;
        let fs = self.fs.as_ref();
        let name = Self::snapshot_name(id);
        let name = name.as_str();
        match fs.run_op(|| async move { fs.lookup_child(ns, name).await }).await? {
            Some(entry) if entry.kind() == Some(InodeKind::Directory) => Ok((ns, entry.inode)),
            _ => Err(not_found()),
        }
    }

    /// Create a new snapshot of the live tree, returning its id
    ///
    /// Fails without changing anything when no id is free or the free
    /// inodes cannot hold a copy of the tree. If the walk fails part way,
    /// the partial snapshot is removed again before the error is returned.
    pub async fn create_snapshot(&self) -> Result<u32> {
        let _op = self.op_lock.lock().await;
        let fs = self.fs.as_ref();
        let namespace = self.config.namespace.as_str();
        let limit = self.config.max_dir_entries;

        let ns = self.namespace_inode().await?;
        let taken = match ns {
            Some(ns) => self.existing(ns).await?,
            None => Vec::new(),
        };
        let id = (1..=self.config.max_snapshots)
            .find(|id| !taken.iter().any(|(t, _)| t == id))
            .ok_or(Error::NoSnapshotId)?;

        let walker = self.walker();
        let needed = walker.count_needed(ROOT_INODE).await? + 1 + u64::from(ns.is_none());
        let free = fs.count_free_inodes().await?;
        if needed > free {
            log::warn!(
                "SNAPSHOT: snapshot needs {} inodes but only {} are free",
                needed,
                free
            );
            return Err(Error::NoFreeInodes);
        }

        let ns = match ns {
            Some(ns) => ns,
            None => {
                fs.run_op(|| async move { make_dir(fs, ROOT_INODE, namespace).await })
                    .await?
            }
        };
        let name = Self::snapshot_name(id);
        let snapshot_name = name.as_str();
        let root = fs
            .run_op(|| async move { make_dir(fs, ns, snapshot_name).await })
            .await?;

        if let Err(e) = walker.clone_dir(ROOT_INODE, root, WalkMode::Snapshot).await {
            log::error!("SNAPSHOT: creating snapshot {} failed: {}", name, e);
            if let Err(cleanup) = delete_tree(fs, ns, &name, limit).await {
                log::warn!("SNAPSHOT: removing partial snapshot {} failed: {}", name, cleanup);
            }
            return Err(e);
        }

        log::info!("SNAPSHOT: created snapshot {} ({} inodes)", name, needed);
        Ok(id)
    }

    /// Delete a snapshot
    pub async fn delete_snapshot(&self, id: u32) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let (ns, _) = self.resolve(id).await?;
        let name = Self::snapshot_name(id);
        delete_tree(&self.fs, ns, &name, self.config.max_dir_entries).await?;
        log::info!("SNAPSHOT: deleted snapshot {}", name);
        Ok(())
    }

    /// Rollback to a snapshot
    ///
    /// The live tree is left untouched when the snapshot does not exist.
    pub async fn rollback_to_snapshot(&self, id: u32) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let (_, root) = self.resolve(id).await?;
        restore::restore_tree(
            &self.fs,
            &self.config.namespace,
            self.config.max_dir_entries,
            root,
        )
        .await?;
        log::info!("SNAPSHOT: rolled back to snapshot {}", Self::snapshot_name(id));
        Ok(())
    }

    async fn metadata(&self, id: u32, root_inode: u64) -> Result<SnapshotMetadata> {
        let fs = self.fs.as_ref();
        let created_at = fs
            .run_op(|| async move {
                let ip = fs.iget(root_inode)?;
                let created = fs.ilock(&ip).await.map(|st| st.disk.ctime);
                fs.iput(ip).await?;
                created
            })
            .await?;
        Ok(SnapshotMetadata {
            id,
            path: format!("/{}/{}", self.config.namespace, Self::snapshot_name(id)),
            root_inode,
            created_at,
        })
    }

    /// List all snapshots in id order
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        let ns = match self.namespace_inode().await? {
            Some(ns) => ns,
            None => return Ok(Vec::new()),
        };
        let mut snapshots = Vec::new();
        for (id, root) in self.existing(ns).await? {
            snapshots.push(self.metadata(id, root).await?);
        }
        Ok(snapshots)
    }

    /// Get snapshot by ID
    pub async fn get_snapshot(&self, id: u32) -> Result<Option<SnapshotMetadata>> {
        match self.resolve(id).await {
            Ok((_, root)) => Ok(Some(self.metadata(id, root).await?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get snapshot statistics
    pub async fn get_snapshot_stats(&self) -> Result<SnapshotStats> {
        let total_snapshots = match self.namespace_inode().await? {
            Some(ns) => self.existing(ns).await?.len(),
            None => 0,
        };
        Ok(SnapshotStats {
            total_snapshots,
            free_ids: (self.config.max_snapshots as usize).saturating_sub(total_snapshots),
            shared_blocks: self.fs.refs().shared_blocks(),
            referenced_blocks: self.fs.refs().referenced_blocks(),
            free_inodes: self.fs.count_free_inodes().await?,
            free_blocks: self.fs.free_blocks(),
        })
    }

    /// Fail with [`Error::SnapshotReadOnly`] if `path` lies in the namespace
    pub async fn check_writable(&self, path: &str) -> Result<()> {
        guard::check_writable(&self.fs, &self.config.namespace, path).await
    }
}
