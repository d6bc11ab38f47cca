//! Rolling the live tree back to a snapshot

use crate::error::Result;
use crate::format::ROOT_INODE;
use crate::layout::DiskFs;
use crate::modules::snapshot::delete::delete_tree;
use crate::modules::snapshot::walker::{TreeWalker, WalkMode};

/// Replace the live tree with the contents of snapshot directory `snapshot`
///
/// Every live entry except the snapshot namespace is deleted, then the
/// snapshot is cloned back onto the root. Both phases carry on past
/// individual failures and report the first one; fatal errors abort.
pub(crate) async fn restore_tree(
    fs: &DiskFs,
    namespace: &str,
    limit: usize,
    snapshot: u64,
) -> Result<()> {
    let walker = TreeWalker::new(fs, namespace, limit);
    let mut first_err = None;

    for entry in walker.children(ROOT_INODE).await? {
        if let Err(e) = delete_tree(fs, ROOT_INODE, &entry.name, limit).await {
            if e.is_fatal() {
                return Err(e);
            }
            log::warn!("RESTORE: wiping '{}' failed: {}", entry.name, e);
            first_err.get_or_insert(e);
        }
    }

    if let Err(e) = walker.clone_dir(snapshot, ROOT_INODE, WalkMode::Restore).await {
        if e.is_fatal() {
            return Err(e);
        }
        first_err.get_or_insert(e);
    }

    first_err.map_or(Ok(()), Err)
}
