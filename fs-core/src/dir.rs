//! Directories and path resolution
//!
//! A directory is an inode whose contents are an array of fixed-size
//! [`DirEntry`] slots. Paths are always resolved from the root; `.` and `..`
//! are ordinary entries looked up like any other name.

use std::io::Cursor;

use crate::error::{Error, Result};
use crate::format::{DirEntry, InodeKind, DIRENT_SIZE, DIRSIZ, ROOT_INODE};
use crate::inode::{CachedInode, InodeRef, InodeState};
use crate::layout::DiskFs;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidPath(name.to_string()));
    }
    if name.len() > DIRSIZ {
        return Err(Error::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// Split a path into its non-empty components
pub(crate) fn components(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for part in &parts {
        validate_name(part)?;
    }
    Ok(parts)
}

impl DiskFs {
    /// Every slot of a directory, empty ones included, with its byte offset
    async fn raw_entries(&self, dp: &InodeState) -> Result<Vec<(u64, DirEntry)>> {
        if !dp.is_dir() {
            return Err(Error::NotADirectory);
        }
        let mut buf = vec![0u8; dp.disk.size as usize];
        let n = self.readi(dp, &mut buf, 0).await?;
        buf[..n]
            .chunks_exact(DIRENT_SIZE)
            .enumerate()
            .map(|(i, raw)| -> Result<(u64, DirEntry)> {
                let entry = DirEntry::read_from(&mut Cursor::new(raw))?;
                Ok(((i * DIRENT_SIZE) as u64, entry))
            })
            .collect()
    }

    /// Find `name` in a locked directory, returning the entry and its offset
    pub async fn dir_lookup(&self, dp: &InodeState, name: &str) -> Result<Option<(DirEntry, u64)>> {
        Ok(self
            .raw_entries(dp)
            .await?
            .into_iter()
            .find(|(_, e)| !e.is_empty() && e.name == name)
            .map(|(off, e)| (e, off)))
    }

    /// Add an entry to a locked directory, reusing an empty slot if there is one
    pub async fn dir_link(&self, dp: &mut InodeState, name: &str, inum: u64, kind: InodeKind) -> Result<()> {
        validate_name(name)?;
        let entries = self.raw_entries(dp).await?;
        if entries.iter().any(|(_, e)| !e.is_empty() && e.name == name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let offset = entries
            .iter()
            .find(|(_, e)| e.is_empty())
            .map(|(off, _)| *off)
            .unwrap_or(dp.disk.size);
        let written = self
            .writei(dp, &DirEntry::new(inum, kind, name).to_bytes(), offset)
            .await?;
        if written != DIRENT_SIZE {
            return Err(Error::Corrupted(format!("dir_link: short write of '{}'", name)));
        }
        Ok(())
    }

    /// Live entries of a locked directory
    ///
    /// Fails with [`Error::DirectoryTooLarge`] when more than `limit` entries
    /// other than `.` and `..` are present.
    pub async fn dir_entries(&self, dp: &InodeState, limit: usize) -> Result<Vec<DirEntry>> {
        let entries: Vec<DirEntry> = self
            .raw_entries(dp)
            .await?
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| !e.is_empty())
            .collect();
        if entries.iter().filter(|e| !e.is_structural()).count() > limit {
            return Err(Error::DirectoryTooLarge(limit));
        }
        Ok(entries)
    }

    /// Whether a locked directory holds nothing but `.` and `..`
    pub async fn dir_is_empty(&self, dp: &InodeState) -> Result<bool> {
        Ok(self
            .raw_entries(dp)
            .await?
            .iter()
            .all(|(_, e)| e.is_empty() || e.is_structural()))
    }

    /// The reference is taken under the directory lock, so an unlink of
    /// `name` cannot free the inode in between.
    async fn step(&self, dp: &CachedInode, name: &str, path: &str) -> Result<InodeRef> {
        let st = self.ilock(dp).await?;
        if !st.is_dir() {
            return Err(Error::NotADirectory);
        }
        match self.dir_lookup(&st, name).await? {
            Some((entry, _)) => self.iget(entry.inode),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    async fn namex(&self, path: &str, want_parent: bool) -> Result<(InodeRef, String)> {
        let parts = components(path)?;
        if want_parent && parts.is_empty() {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let mut ip = self.iget(ROOT_INODE)?;
        for (i, name) in parts.iter().enumerate() {
            if want_parent && i + 1 == parts.len() {
                return Ok((ip, name.to_string()));
            }
            let next = self.step(&ip, name, path).await;
            self.iput(ip).await?;
            ip = next?;
        }
        Ok((ip, String::new()))
    }

    /// Resolve a path to its inode
    pub async fn namei(&self, path: &str) -> Result<InodeRef> {
        Ok(self.namex(path, false).await?.0)
    }

    /// Resolve the parent directory of a path, plus the final component
    pub async fn nameiparent(&self, path: &str) -> Result<(InodeRef, String)> {
        self.namex(path, true).await
    }

    async fn inode_kind(&self, ip: &CachedInode) -> Result<InodeKind> {
        Ok(self.ilock(ip).await?.disk.kind)
    }

    /// Create `path`, returning a referenced (unlocked) inode
    ///
    /// Opening an existing file or device as a file succeeds and returns it;
    /// any other existing entry is [`Error::AlreadyExists`].
    pub async fn create(&self, path: &str, kind: InodeKind, major: u16, minor: u16) -> Result<InodeRef> {
        let (dp, name) = self.nameiparent(path).await?;
        let created = self.create_in(&dp, &name, kind, major, minor).await;
        let put = self.iput(dp).await;
        let ip = created?;
        if let Err(e) = put {
            self.iput(ip).await.ok();
            return Err(e);
        }
        Ok(ip)
    }

    async fn create_in(
        &self,
        dp: &CachedInode,
        name: &str,
        kind: InodeKind,
        major: u16,
        minor: u16,
    ) -> Result<InodeRef> {
        let mut dst = self.ilock(dp).await?;
        if !dst.is_dir() {
            return Err(Error::NotADirectory);
        }
        if let Some((entry, _)) = self.dir_lookup(&dst, name).await? {
            drop(dst);
            let ip = self.iget(entry.inode)?;
            let found = self.inode_kind(&ip).await;
            return match found {
                Ok(InodeKind::File | InodeKind::Device) if kind == InodeKind::File => Ok(ip),
                Ok(_) => {
                    self.iput(ip).await?;
                    Err(Error::AlreadyExists(name.to_string()))
                }
                Err(e) => {
                    self.iput(ip).await.ok();
                    Err(e)
                }
            };
        }
        self.create_child(&mut dst, name, kind, major, minor).await
    }

    /// Allocate a new inode and link it into a locked directory as `name`
    ///
    /// On failure the new inode is released again.
    pub async fn create_child(
        &self,
        dp: &mut InodeState,
        name: &str,
        kind: InodeKind,
        major: u16,
        minor: u16,
    ) -> Result<InodeRef> {
        validate_name(name)?;
        if self.dir_lookup(dp, name).await?.is_some() {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let ip = self.ialloc(kind).await?;
        match self.init_child(dp, &ip, name, kind, major, minor).await {
            Ok(()) => Ok(ip),
            Err(e) => {
                if let Ok(mut st) = self.ilock(&ip).await {
                    st.disk.links = 0;
                }
                self.iput(ip).await.ok();
                Err(e)
            }
        }
    }

    async fn init_child(
        &self,
        dp: &mut InodeState,
        ip: &CachedInode,
        name: &str,
        kind: InodeKind,
        major: u16,
        minor: u16,
    ) -> Result<()> {
        let mut st = self.ilock(ip).await?;
        st.disk.major = major;
        st.disk.minor = minor;
        st.disk.links = 1;
        self.iupdate(&st).await?;

        if kind == InodeKind::Directory {
            let inum = st.inum();
            self.dir_link(&mut st, ".", inum, InodeKind::Directory).await?;
            self.dir_link(&mut st, "..", dp.inum(), InodeKind::Directory).await?;
        }
        self.dir_link(dp, name, st.inum(), kind).await?;
        if kind == InodeKind::Directory {
            // For the child's "..".
            dp.disk.links += 1;
            self.iupdate(dp).await?;
        }
        Ok(())
    }

    /// Look up `name` in directory `dir_inum`
    pub async fn lookup_child(&self, dir_inum: u64, name: &str) -> Result<Option<DirEntry>> {
        let dp = self.iget(dir_inum)?;
        let found = self.lookup_in(&dp, name).await;
        let put = self.iput(dp).await;
        let entry = found?;
        put?;
        Ok(entry)
    }

    async fn lookup_in(&self, dp: &CachedInode, name: &str) -> Result<Option<DirEntry>> {
        let st = self.ilock(dp).await?;
        Ok(self.dir_lookup(&st, name).await?.map(|(e, _)| e))
    }

    /// Remove the entry at `path`
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let (dp, name) = self.nameiparent(path).await?;
        let result = self.unlink_in(&dp, &name).await;
        let put = self.iput(dp).await;
        result?;
        put
    }

    /// Remove entry `name` from directory `dir_inum`
    pub async fn unlink_child(&self, dir_inum: u64, name: &str) -> Result<()> {
        let dp = self.iget(dir_inum)?;
        let result = self.unlink_in(&dp, name).await;
        let put = self.iput(dp).await;
        result?;
        put
    }

    async fn unlink_in(&self, dp: &CachedInode, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(Error::InvalidArgument(format!("cannot unlink '{}'", name)));
        }
        let mut dst = self.ilock(dp).await?;
        let (entry, offset) = self
            .dir_lookup(&dst, name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let ip = self.iget(entry.inode)?;
        let result = self.unlink_entry(&mut dst, &ip, offset).await;
        drop(dst);
        // Frees the inode if that was its last link.
        let put = self.iput(ip).await;
        result?;
        put
    }

    async fn unlink_entry(&self, dp: &mut InodeState, ip: &CachedInode, offset: u64) -> Result<()> {
        let mut st = self.ilock(ip).await?;
        if st.disk.links < 1 {
            return Err(Error::Corrupted("unlink: nlink < 1".to_string()));
        }
        if st.is_dir() && !self.dir_is_empty(&st).await? {
            return Err(Error::DirectoryNotEmpty);
        }

        self.writei(dp, &DirEntry::empty().to_bytes(), offset).await?;
        if st.is_dir() {
            dp.disk.links = dp.disk.links.saturating_sub(1);
            self.iupdate(dp).await?;
        }
        st.disk.links -= 1;
        self.iupdate(&st).await
    }

    /// Add a second name `new` for the file at `old`
    pub async fn link(&self, old: &str, new: &str) -> Result<()> {
        let ip = self.namei(old).await?;
        let result = self.link_inode(&ip, new).await;
        let put = self.iput(ip).await;
        result?;
        put
    }

    async fn link_inode(&self, ip: &CachedInode, new: &str) -> Result<()> {
        let kind = {
            let mut st = self.ilock(ip).await?;
            if st.is_dir() {
                return Err(Error::IsADirectory);
            }
            st.disk.links += 1;
            self.iupdate(&st).await?;
            st.disk.kind
        };

        if let Err(e) = self.link_into(new, ip.inum(), kind).await {
            let mut st = self.ilock(ip).await?;
            st.disk.links -= 1;
            self.iupdate(&st).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn link_into(&self, path: &str, inum: u64, kind: InodeKind) -> Result<()> {
        let (dp, name) = self.nameiparent(path).await?;
        let result = async {
            let mut dst = self.ilock(&dp).await?;
            self.dir_link(&mut dst, &name, inum, kind).await
        }
        .await;
        let put = self.iput(dp).await;
        result?;
        put
    }
}
