//! SnapFS on-disk format
//!
//! Block 0 holds the superblock, so block number 0 doubles as the null
//! block pointer. The remaining regions follow in order: journal, free
//! bitmap, inode table, data.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::layout::Layout;

/// Magic number for SnapFS filesystem
pub const SNAPFS_MAGIC: &[u8; 8] = b"SNAPFS\x00\x00";
/// Current filesystem version
pub const FS_VERSION: u32 = 1;
/// Inode number of the root directory
pub const ROOT_INODE: u64 = 1;
/// Size of an on-disk inode in bytes
pub const INODE_SIZE: usize = 128;
/// Inodes per inode-table block
pub const INODES_PER_BLOCK: u64 = (BLOCK_SIZE / INODE_SIZE) as u64;
/// Number of direct block pointers in an inode
pub const NDIRECT: usize = 10;
/// Number of block pointers held by the indirect block
pub const NINDIRECT: usize = BLOCK_SIZE / 8;
/// Largest file, in blocks
pub const MAX_FILE_BLOCKS: u64 = (NDIRECT + NINDIRECT) as u64;
/// Size of an on-disk directory entry in bytes
pub const DIRENT_SIZE: usize = 64;
/// Longest file name stored in a directory entry
pub const DIRSIZ: usize = DIRENT_SIZE - 10;
/// Default journal size in blocks (header plus log)
pub const DEFAULT_JOURNAL_BLOCKS: u64 = 128;

/// Error type for filesystem formatting operations
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported filesystem version: {0}")]
    UnsupportedVersion(u32),
    #[error("Invalid filesystem size: {0}")]
    InvalidSize(String),
    #[error("Invalid inode type: {0}")]
    InvalidInodeKind(u16),
}

/// Inode type as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeKind {
    /// Unallocated slot
    Free = 0,
    /// Directory
    Directory = 1,
    /// Regular file
    File = 2,
    /// Device node
    Device = 3,
}

impl InodeKind {
    /// Decode the on-disk representation
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(InodeKind::Free),
            1 => Some(InodeKind::Directory),
            2 => Some(InodeKind::File),
            3 => Some(InodeKind::Device),
            _ => None,
        }
    }

    /// Short name used in listings
    pub fn as_str(&self) -> &'static str {
        match self {
            InodeKind::Free => "free",
            InodeKind::Directory => "dir",
            InodeKind::File => "file",
            InodeKind::Device => "dev",
        }
    }
}

/// On-disk inode structure (128 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    /// Inode type
    pub kind: InodeKind,
    /// Device major number (device nodes only)
    pub major: u16,
    /// Device minor number (device nodes only)
    pub minor: u16,
    /// Number of directory entries referring to this inode
    pub links: u16,
    /// Permission bits
    pub perm: u32,
    /// Size in bytes
    pub size: u64,
    /// Creation time (seconds since the epoch)
    pub ctime: u64,
    /// Last modification time
    pub mtime: u64,
    /// Direct block pointers followed by the indirect block pointer
    pub addrs: [u64; NDIRECT + 1],
}

impl Default for DiskInode {
    fn default() -> Self {
        Self {
            kind: InodeKind::Free,
            major: 0,
            minor: 0,
            links: 0,
            perm: 0,
            size: 0,
            ctime: 0,
            mtime: 0,
            addrs: [0; NDIRECT + 1],
        }
    }
}

impl DiskInode {
    /// A fresh inode of the given kind
    pub fn new(kind: InodeKind, now: u64) -> Self {
        Self {
            kind,
            perm: if kind == InodeKind::Directory { 0o755 } else { 0o644 },
            ctime: now,
            mtime: now,
            ..Default::default()
        }
    }

    /// Write inode to buffer (exactly [`INODE_SIZE`] bytes)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buffer = [0u8; INODE_SIZE];
        let mut cursor = Cursor::new(&mut buffer[..]);

        cursor.write_u16::<LittleEndian>(self.kind as u16)?;
        cursor.write_u16::<LittleEndian>(self.major)?;
        cursor.write_u16::<LittleEndian>(self.minor)?;
        cursor.write_u16::<LittleEndian>(self.links)?;
        cursor.write_u32::<LittleEndian>(self.perm)?;
        cursor.write_u64::<LittleEndian>(self.size)?;
        cursor.write_u64::<LittleEndian>(self.ctime)?;
        cursor.write_u64::<LittleEndian>(self.mtime)?;
        for &addr in &self.addrs {
            cursor.write_u64::<LittleEndian>(addr)?;
        }

        writer.write_all(&buffer)
    }

    /// Read an inode from exactly [`INODE_SIZE`] bytes
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let raw_kind = reader.read_u16::<LittleEndian>()?;
        let kind = InodeKind::from_raw(raw_kind).ok_or(FormatError::InvalidInodeKind(raw_kind))?;
        let major = reader.read_u16::<LittleEndian>()?;
        let minor = reader.read_u16::<LittleEndian>()?;
        let links = reader.read_u16::<LittleEndian>()?;
        let perm = reader.read_u32::<LittleEndian>()?;
        let size = reader.read_u64::<LittleEndian>()?;
        let ctime = reader.read_u64::<LittleEndian>()?;
        let mtime = reader.read_u64::<LittleEndian>()?;
        let mut addrs = [0u64; NDIRECT + 1];
        for addr in addrs.iter_mut() {
            *addr = reader.read_u64::<LittleEndian>()?;
        }

        Ok(Self {
            kind,
            major,
            minor,
            links,
            perm,
            size,
            ctime,
            mtime,
            addrs,
        })
    }

    /// Decode the inode stored at `offset` inside an inode-table block
    pub fn from_block(block: &[u8], offset: usize) -> Result<Self, FormatError> {
        Self::read_from(&mut Cursor::new(&block[offset..offset + INODE_SIZE]))
    }

    /// Encode the inode into an inode-table block at `offset`
    pub fn store_in_block(&self, block: &mut [u8], offset: usize) -> io::Result<()> {
        self.write_to(&mut Cursor::new(&mut block[offset..offset + INODE_SIZE]))
    }
}

/// Directory entry structure (fixed [`DIRENT_SIZE`] bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number, 0 for an empty slot
    pub inode: u64,
    /// Inode type of the target, as [`InodeKind`]
    pub file_type: u8,
    /// File name (up to [`DIRSIZ`] bytes)
    pub name: String,
}

impl DirEntry {
    /// Create a new directory entry
    pub fn new(inode: u64, kind: InodeKind, name: &str) -> Self {
        Self {
            inode,
            file_type: kind as u16 as u8,
            name: name.to_string(),
        }
    }

    /// An empty slot
    pub fn empty() -> Self {
        Self {
            inode: 0,
            file_type: 0,
            name: String::new(),
        }
    }

    /// Whether this slot is unused
    pub fn is_empty(&self) -> bool {
        self.inode == 0
    }

    /// Whether this is the "." or ".." entry
    pub fn is_structural(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// Inode type recorded in the entry
    pub fn kind(&self) -> Option<InodeKind> {
        InodeKind::from_raw(self.file_type as u16)
    }

    /// Write directory entry to writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let name_bytes = self.name.as_bytes();
        let name_len = name_bytes.len().min(DIRSIZ);

        writer.write_u64::<LittleEndian>(self.inode)?;
        writer.write_u8(self.file_type)?;
        writer.write_u8(name_len as u8)?;
        let mut name = [0u8; DIRSIZ];
        name[..name_len].copy_from_slice(&name_bytes[..name_len]);
        writer.write_all(&name)
    }

    /// Read a directory entry from exactly [`DIRENT_SIZE`] bytes
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let inode = reader.read_u64::<LittleEndian>()?;
        let file_type = reader.read_u8()?;
        let name_len = (reader.read_u8()? as usize).min(DIRSIZ);
        let mut name = [0u8; DIRSIZ];
        reader.read_exact(&mut name)?;

        Ok(Self {
            inode,
            file_type,
            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
        })
    }

    /// Encode into a byte array
    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        // Writing into a fixed-size slice of the exact length cannot fail.
        let _ = self.write_to(&mut Cursor::new(&mut buf[..]));
        buf
    }
}

/// Filesystem superblock (block 0)
#[derive(Debug, Clone)]
pub struct Superblock {
    /// Magic number (SNAPFS\0\0)
    pub magic: [u8; 8],
    /// Filesystem version
    pub version: u32,
    /// Block size in bytes
    pub block_size: u32,
    /// Number of blocks in the filesystem
    pub block_count: u64,
    /// Number of inode slots, including the unused slot 0
    pub inode_count: u64,
    /// Number of journal blocks, including the header
    pub journal_blocks: u64,
    /// Root inode number
    pub root_inode: u64,
    /// Format timestamp
    pub created_at: u64,
    /// Filesystem UUID
    pub uuid: [u8; 16],
    /// Volume name
    pub volume_name: [u8; 64],
}

impl Superblock {
    /// Serialized size of the superblock in bytes
    pub const SIZE: usize = 8 + 4 + 4 + 8 * 5 + 16 + 64;

    /// Create a new superblock
    pub fn new(
        block_count: u64,
        inode_count: u64,
        journal_blocks: u64,
        volume_name: Option<&str>,
    ) -> Result<Self, FormatError> {
        let mut uuid = [0u8; 16];
        getrandom::getrandom(&mut uuid)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut name = [0u8; 64];
        if let Some(volume) = volume_name {
            let bytes = volume.as_bytes();
            let len = bytes.len().min(63);
            name[..len].copy_from_slice(&bytes[..len]);
        }

        Ok(Self {
            magic: *SNAPFS_MAGIC,
            version: FS_VERSION,
            block_size: BLOCK_SIZE as u32,
            block_count,
            inode_count,
            journal_blocks,
            root_inode: ROOT_INODE,
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
            uuid,
            volume_name: name,
        })
    }

    /// Region boundaries derived from the superblock
    pub fn layout(&self) -> Layout {
        Layout::new(self.block_count, self.inode_count, self.journal_blocks)
    }

    /// Volume name as a string
    pub fn volume_name(&self) -> String {
        let end = self
            .volume_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.volume_name.len());
        String::from_utf8_lossy(&self.volume_name[..end]).into_owned()
    }

    /// Write the superblock to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u64::<LittleEndian>(self.block_count)?;
        writer.write_u64::<LittleEndian>(self.inode_count)?;
        writer.write_u64::<LittleEndian>(self.journal_blocks)?;
        writer.write_u64::<LittleEndian>(self.root_inode)?;
        writer.write_u64::<LittleEndian>(self.created_at)?;
        writer.write_all(&self.uuid)?;
        writer.write_all(&self.volume_name)
    }

    /// Read a superblock from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPFS_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != FS_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let block_size = reader.read_u32::<LittleEndian>()?;
        if block_size as usize != BLOCK_SIZE {
            return Err(FormatError::InvalidSize(format!(
                "block size {} is not supported",
                block_size
            )));
        }
        let block_count = reader.read_u64::<LittleEndian>()?;
        let inode_count = reader.read_u64::<LittleEndian>()?;
        let journal_blocks = reader.read_u64::<LittleEndian>()?;
        let root_inode = reader.read_u64::<LittleEndian>()?;
        let created_at = reader.read_u64::<LittleEndian>()?;
        let mut uuid = [0u8; 16];
        reader.read_exact(&mut uuid)?;
        let mut volume_name = [0u8; 64];
        reader.read_exact(&mut volume_name)?;

        Ok(Self {
            magic,
            version,
            block_size,
            block_count,
            inode_count,
            journal_blocks,
            root_inode,
            created_at,
            uuid,
            volume_name,
        })
    }

    /// Load and validate the superblock from block 0 of a device
    pub async fn load(device: &dyn BlockDevice) -> Result<Self, FormatError> {
        let mut block = vec![0u8; BLOCK_SIZE];
        device.read_block(0, &mut block).await?;
        let sb = Self::read_from(&mut Cursor::new(&block[..]))?;
        if sb.block_count > device.block_count() {
            return Err(FormatError::InvalidSize(format!(
                "superblock claims {} blocks but the device has {}",
                sb.block_count,
                device.block_count()
            )));
        }
        Ok(sb)
    }
}

/// Options for [`mkfs`]
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Number of inode slots; derived from the device size when `None`
    pub inode_count: Option<u64>,
    /// Journal size in blocks, header included
    pub journal_blocks: u64,
    /// Optional volume label
    pub volume_name: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            inode_count: None,
            journal_blocks: DEFAULT_JOURNAL_BLOCKS,
            volume_name: None,
        }
    }
}

/// Default inode count: one inode per four blocks, rounded up to a whole table block
fn default_inode_count(block_count: u64) -> u64 {
    let wanted = (block_count / 4).max(INODES_PER_BLOCK);
    wanted.div_ceil(INODES_PER_BLOCK) * INODES_PER_BLOCK
}

/// Format a block device as a SnapFS filesystem
///
/// Writes the superblock, clears the journal header, bitmap and inode
/// table, and creates a root directory holding "." and "..".
pub async fn mkfs(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Superblock, FormatError> {
    let block_count = device.block_count();
    let inode_count = options
        .inode_count
        .unwrap_or_else(|| default_inode_count(block_count));
    if options.journal_blocks < 2 {
        return Err(FormatError::InvalidSize(
            "journal needs at least a header and one log block".to_string(),
        ));
    }
    if inode_count < 2 {
        return Err(FormatError::InvalidSize("at least two inode slots are required".to_string()));
    }

    let sb = Superblock::new(
        block_count,
        inode_count,
        options.journal_blocks,
        options.volume_name.as_deref(),
    )?;
    let layout = sb.layout();
    if layout.data_start >= block_count || layout.data_blocks_count < 8 {
        return Err(FormatError::InvalidSize(format!(
            "{} blocks is too small for {} inodes and a {} block journal",
            block_count, inode_count, options.journal_blocks
        )));
    }

    log::info!(
        "FORMAT: {} blocks, {} inodes, journal {}..{}, bitmap {}..{}, inodes {}..{}, data {}..",
        block_count,
        inode_count,
        layout.journal_start,
        layout.bitmap_start,
        layout.bitmap_start,
        layout.inode_table_start,
        layout.inode_table_start,
        layout.data_start,
        layout.data_start
    );

    let zero = vec![0u8; BLOCK_SIZE];
    device.write_block(layout.journal_start, &zero).await?;
    for block in layout.inode_table_start..layout.data_start {
        device.write_block(block, &zero).await?;
    }

    // Root directory occupies the first data block.
    let root_block = layout.data_start;
    let mut bitmap = vec![0u8; (layout.bitmap_blocks as usize) * BLOCK_SIZE];
    for block in 0..=root_block {
        bitmap[(block / 8) as usize] |= 1 << (block % 8);
    }
    for (i, chunk) in bitmap.chunks(BLOCK_SIZE).enumerate() {
        device.write_block(layout.bitmap_start + i as u64, chunk).await?;
    }

    let mut dir_block = vec![0u8; BLOCK_SIZE];
    dir_block[..DIRENT_SIZE]
        .copy_from_slice(&DirEntry::new(ROOT_INODE, InodeKind::Directory, ".").to_bytes());
    dir_block[DIRENT_SIZE..2 * DIRENT_SIZE]
        .copy_from_slice(&DirEntry::new(ROOT_INODE, InodeKind::Directory, "..").to_bytes());
    device.write_block(root_block, &dir_block).await?;

    let mut root = DiskInode::new(InodeKind::Directory, sb.created_at);
    root.links = 1;
    root.size = 2 * DIRENT_SIZE as u64;
    root.addrs[0] = root_block;
    let (table_block, offset) = layout.inode_block(ROOT_INODE);
    let mut table = vec![0u8; BLOCK_SIZE];
    root.store_in_block(&mut table, offset)?;
    device.write_block(table_block, &table).await?;

    let mut sb_block = vec![0u8; BLOCK_SIZE];
    sb.write_to(&mut Cursor::new(&mut sb_block[..]))?;
    device.write_block(0, &sb_block).await?;
    device.sync().await?;

    log::info!("FORMAT: filesystem created ({} data blocks)", layout.data_blocks_count);
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock::new(4096, 256, 64, Some("testfs")).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        sb.write_to(&mut Cursor::new(&mut buf[..])).unwrap();

        let read = Superblock::read_from(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read.magic, *SNAPFS_MAGIC);
        assert_eq!(read.block_count, 4096);
        assert_eq!(read.inode_count, 256);
        assert_eq!(read.journal_blocks, 64);
        assert_eq!(read.uuid, sb.uuid);
        assert_eq!(read.volume_name(), "testfs");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = vec![0u8; BLOCK_SIZE];
        assert!(matches!(
            Superblock::read_from(&mut Cursor::new(&buf[..])),
            Err(FormatError::InvalidMagic)
        ));
    }

    #[test]
    fn test_inode_fits_slot() {
        let mut inode = DiskInode::new(InodeKind::File, 42);
        inode.links = 3;
        inode.size = 12345;
        inode.addrs[0] = 77;
        inode.addrs[NDIRECT] = 99;

        let mut block = vec![0u8; BLOCK_SIZE];
        inode.store_in_block(&mut block, 5 * INODE_SIZE).unwrap();
        assert!(block[..5 * INODE_SIZE].iter().all(|&b| b == 0));
        assert!(block[6 * INODE_SIZE..].iter().all(|&b| b == 0));
        assert_eq!(DiskInode::from_block(&block, 5 * INODE_SIZE).unwrap(), inode);
    }

    #[test]
    fn test_dir_entry_name_limit() {
        let long = "x".repeat(DIRSIZ + 10);
        let entry = DirEntry::new(9, InodeKind::File, &long);
        let bytes = entry.to_bytes();
        let decoded = DirEntry::read_from(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(decoded.name.len(), DIRSIZ);
        assert_eq!(decoded.kind(), Some(InodeKind::File));
    }

    #[tokio::test]
    async fn test_mkfs_creates_root() {
        let device = MemBlockDevice::new(1024);
        let sb = mkfs(&device, &FormatOptions::default()).await.unwrap();
        let layout = sb.layout();

        let loaded = Superblock::load(&device).await.unwrap();
        assert_eq!(loaded.uuid, sb.uuid);

        let (table_block, offset) = layout.inode_block(ROOT_INODE);
        let mut block = vec![0u8; BLOCK_SIZE];
        device.read_block(table_block, &mut block).await.unwrap();
        let root = DiskInode::from_block(&block, offset).unwrap();
        assert_eq!(root.kind, InodeKind::Directory);
        assert_eq!(root.size, 2 * DIRENT_SIZE as u64);
        assert_eq!(root.addrs[0], layout.data_start);
    }

    #[tokio::test]
    async fn test_mkfs_rejects_tiny_device() {
        let device = MemBlockDevice::new(16);
        let result = mkfs(&device, &FormatOptions::default()).await;
        assert!(matches!(result, Err(FormatError::InvalidSize(_))));
    }
}
