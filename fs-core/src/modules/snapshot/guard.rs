//! Read-only enforcement for the snapshot namespace
//!
//! Every mutating entry point of the live tree runs its target paths
//! through [`check_writable`] before touching storage.

use crate::error::{Error, Result};
use crate::format::ROOT_INODE;
use crate::layout::DiskFs;

/// Reject paths whose first component, after resolving `.` and `..`
/// lexically, is the snapshot namespace
pub fn check_path(namespace: &str, path: &str) -> Result<()> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.first() == Some(&namespace) {
        return Err(Error::SnapshotReadOnly(path.to_string()));
    }
    Ok(())
}

/// Reject paths whose parent directory lies inside the snapshot namespace,
/// found by following `..` from the parent up to the root
///
/// Paths whose parent does not resolve are let through; the operation
/// itself reports them.
pub async fn check_ancestry(fs: &DiskFs, namespace: &str, path: &str) -> Result<()> {
    // iput may free a directory unlinked meanwhile, which needs an open op.
    fs.run_op(|| async move {
        let ns = match fs.lookup_child(ROOT_INODE, namespace).await? {
            Some(entry) => entry.inode,
            None => return Ok(()),
        };
        let mut current = match fs.nameiparent(path).await {
            Ok((dp, _)) => dp,
            Err(_) => return Ok(()),
        };

        let max_depth = fs.layout().inode_count;
        let mut depth = 0;
        let verdict = loop {
            let inum = current.inum();
            if inum == ROOT_INODE {
                break Ok(());
            }
            if inum == ns {
                break Err(Error::SnapshotReadOnly(path.to_string()));
            }
            depth += 1;
            if depth > max_depth {
                break Err(Error::Corrupted(format!(
                    "guard: '..' chain above '{}' never reaches the root",
                    path
                )));
            }

            // Held until the parent is referenced, so '..' stays readable.
            let parent = match fs.lookup_child(inum, "..").await {
                Ok(Some(entry)) => entry.inode,
                Ok(None) => break Err(Error::Corrupted(format!("guard: directory {} has no '..'", inum))),
                Err(e) => break Err(e),
            };
            let next = match fs.iget(parent) {
                Ok(ip) => ip,
                Err(e) => break Err(e),
            };
            if let Err(e) = fs.iput(std::mem::replace(&mut current, next)).await {
                break Err(e);
            }
        };
        let put = fs.iput(current).await;
        verdict?;
        put
    })
    .await
}

/// Both checks, cheapest first
pub async fn check_writable(fs: &DiskFs, namespace: &str, path: &str) -> Result<()> {
    check_path(namespace, path)?;
    check_ancestry(fs, namespace, path).await
}
