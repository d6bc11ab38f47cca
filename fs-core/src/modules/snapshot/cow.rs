//! Copy-on-write barrier
//!
//! Called by `writei` before a file block is modified. A block whose
//! reference count is above one is shared with another tree, so the writer
//! gets a private copy first. For blocks past the direct range the indirect
//! block is made private before any of its entries are redirected.

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::NDIRECT;
use crate::inode::InodeState;
use crate::layout::DiskFs;

/// Allocate a private copy of `block` holding the same bytes
async fn copy_block(fs: &DiskFs, block: u64) -> Result<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    fs.read_block(block, &mut buf).await?;
    let copy = fs.alloc_block()?;
    fs.write_block(copy, &buf)?;
    Ok(copy)
}

/// Make the inode's indirect block exclusively owned, allocating it if absent
pub(crate) async fn ensure_unique_indirect(fs: &DiskFs, st: &mut InodeState) -> Result<()> {
    let indirect = st.disk.addrs[NDIRECT];
    if indirect == 0 {
        let block = fs.alloc_block()?;
        fs.refs.increment(block);
        st.disk.addrs[NDIRECT] = block;
        return fs.iupdate(st).await;
    }
    if fs.refs.get(indirect) <= 1 {
        return Ok(());
    }

    // Entry counts are per inode, so they stay as they are; only the
    // table itself changes owner.
    let copy = copy_block(fs, indirect).await?;
    st.disk.addrs[NDIRECT] = copy;
    fs.iupdate(st).await?;
    fs.release_block(indirect)?;
    fs.refs.increment(copy);

    log::debug!(
        "COW: inode {} indirect block {} -> {}",
        st.inum(),
        indirect,
        copy
    );
    Ok(())
}

/// Give the inode a private copy of logical block `bn` if it is shared
///
/// `addr` is the block currently mapped at `bn`. Returns the block the
/// caller should write to.
pub(crate) async fn unshare_data_block(fs: &DiskFs, st: &mut InodeState, bn: u64, addr: u64) -> Result<u64> {
    if fs.refs.get(addr) <= 1 {
        return Ok(addr);
    }

    let copy = copy_block(fs, addr).await?;
    if bn < NDIRECT as u64 {
        let current = st.disk.addrs[bn as usize];
        if current != addr {
            return Err(Error::Corrupted(format!(
                "cow: inode {} block {} maps {} not {}",
                st.inum(),
                bn,
                current,
                addr
            )));
        }
        st.disk.addrs[bn as usize] = copy;
        fs.iupdate(st).await?;
    } else {
        let indirect = st.disk.addrs[NDIRECT];
        let index = (bn - NDIRECT as u64) as usize;
        let current = fs.indirect_entry(indirect, index).await?;
        if current != addr {
            return Err(Error::Corrupted(format!(
                "cow: inode {} block {} maps {} not {}",
                st.inum(),
                bn,
                current,
                addr
            )));
        }
        fs.set_indirect_entry(indirect, index, copy).await?;
    }

    // A concurrent writer may have unshared the same block already, in
    // which case this drops the last reference and frees it.
    fs.release_block(addr)?;
    fs.refs.increment(copy);

    log::debug!("COW: inode {} block {} {} -> {}", st.inum(), bn, addr, copy);
    Ok(copy)
}
