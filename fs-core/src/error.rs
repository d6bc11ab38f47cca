//! Crate-wide error type for SnapFS

use std::io;
use thiserror::Error;

use crate::block_bitmap::BlockBitmapError;
use crate::blockdev::BlockDeviceError;
use crate::format::FormatError;
use crate::modules::journaling::JournalError;

/// Errors surfaced by filesystem and snapshot operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Block bitmap error: {0}")]
    Bitmap(#[from] BlockBitmapError),
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("No free inodes")]
    NoFreeInodes,
    #[error("No free blocks")]
    NoFreeBlocks,
    #[error("No free snapshot id")]
    NoSnapshotId,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Snapshot namespace is read-only: {0}")]
    SnapshotReadOnly(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Name too long: {0}")]
    NameTooLong(String),
    #[error("File too large")]
    FileTooLarge,
    #[error("Directory has more than {0} entries")]
    DirectoryTooLarge(usize),
    #[error("Inode cache is full")]
    InodeCacheFull,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation not supported: {0}")]
    Unsupported(String),
    /// On-disk or in-memory state violates a filesystem invariant.
    #[error("Filesystem corrupted: {0}")]
    Corrupted(String),
}

impl Error {
    /// Whether the error indicates corruption rather than a user-recoverable condition.
    ///
    /// Tree walkers stop at fatal errors instead of continuing with siblings.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corrupted(_) | Error::Journal(JournalError::NotInTransaction)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
