//! SnapFS Core - a journaled xv6-style filesystem with copy-on-write snapshots
//!
//! This crate provides the on-disk format, block cache, journal, inode and
//! directory layers, and the snapshot engine. A snapshot is a read-only copy
//! of the live tree under `/snapshot/NN` that shares data blocks with the
//! live files until either side is written.
//!
//! Most users want [`Vfs`]:
//!
//! ```no_run
//! # async fn demo() -> snapfs::Result<()> {
//! use std::sync::Arc;
//! use snapfs::{FormatOptions, FsConfig, MemBlockDevice, Vfs};
//!
//! let device = Arc::new(MemBlockDevice::new(4096));
//! let vfs = Vfs::format(device, &FormatOptions::default(), FsConfig::default()).await?;
//! vfs.write_file("/hello", b"world").await?;
//! let id = vfs.snapshot_create().await?;
//! vfs.write_file("/hello", b"changed").await?;
//! vfs.snapshot_rollback(id).await?;
//! assert_eq!(vfs.read_file("/hello").await?, b"world");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod block_bitmap;
pub mod blockdev;
pub mod cache;
pub mod config;
pub mod dir;
pub mod error;
pub mod format;
pub mod inode;
pub mod layout;
pub mod modules;
pub mod vfs;

// Re-export the types most callers need
pub use blockdev::{BlockDevice, FileBackedBlockDevice, MemBlockDevice, BLOCK_SIZE};
pub use config::FsConfig;
pub use error::{Error, Result};
pub use format::{mkfs, FormatOptions, InodeKind};
pub use inode::Stat;
pub use layout::DiskFs;
pub use modules::{ScrubReport, SnapshotConfig, SnapshotMetadata, SnapshotStats};
pub use vfs::{BlockMapping, DirEntryInfo, File, OpenFlags, Vfs};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::error::Result;
    pub use crate::vfs::{OpenFlags, Vfs};
}
