//! SnapFS feature modules
//!
//! The journal gives every metadata update crash atomicity, the snapshot
//! module layers copy-on-write snapshots on top of it, and scrub checks the
//! two against each other.

pub mod journaling;
pub mod scrub;
pub mod snapshot;

// Re-export journaling types
pub use journaling::{JournalConfig, JournalError, JournalManager};

// Re-export scrub types
pub use scrub::{RefMismatch, ScrubReport};

// Re-export snapshot types
pub use snapshot::{
    guard::check_writable, refcount::RefTable, SnapshotConfig, SnapshotManager, SnapshotMetadata,
    SnapshotStats,
};
