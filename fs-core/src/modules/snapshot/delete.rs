//! Post-order tree deletion

use futures::future::{BoxFuture, FutureExt};

use crate::error::{Error, Result};
use crate::format::InodeKind;
use crate::layout::DiskFs;
use crate::modules::snapshot::walker::collect_children;

/// Remove entry `name` of directory `parent` and everything below it
///
/// Children go first; a failed child does not stop its siblings, but its
/// parent is left in place and the first error is returned. Fatal errors
/// stop the deletion immediately. Each unlink is its own operation.
pub(crate) fn delete_tree<'a>(
    fs: &'a DiskFs,
    parent: u64,
    name: &'a str,
    limit: usize,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let entry = fs
            .run_op(|| async move { fs.lookup_child(parent, name).await })
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        if entry.kind() == Some(InodeKind::Directory) {
            let mut first_err = None;
            for child in collect_children(fs, entry.inode, limit, None).await? {
                if let Err(e) = delete_tree(fs, entry.inode, &child.name, limit).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    log::warn!("DELETE: removing '{}' under '{}' failed: {}", child.name, name, e);
                    first_err.get_or_insert(e);
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }

        fs.run_op(|| async move { fs.unlink_child(parent, name).await })
            .await
    }
    .boxed()
}
