//! Mount-time configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::modules::journaling::JournalConfig;
use crate::modules::snapshot::SnapshotConfig;

/// Tunables applied when a filesystem is mounted
///
/// Missing fields in a JSON config fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Block cache capacity, in blocks
    pub cache_blocks: usize,
    /// Write cached blocks straight through to the device
    pub write_through: bool,
    /// Maximum number of inodes referenced at once
    pub inode_cache_slots: usize,
    /// Reference table capacity; defaults to the device block count
    pub refcount_capacity: Option<u64>,
    /// Journal tunables
    pub journal: JournalConfig,
    /// Snapshot tunables
    pub snapshot: SnapshotConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 1024,
            write_through: true,
            inode_cache_slots: 256,
            refcount_capacity: None,
            journal: JournalConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl FsConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FsConfig::from_json_str(
            r#"{ "cache_blocks": 64, "snapshot": { "max_dir_entries": 16 } }"#,
        )
        .unwrap();
        assert_eq!(config.cache_blocks, 64);
        assert!(config.write_through);
        assert_eq!(config.snapshot.max_dir_entries, 16);
        assert_eq!(config.snapshot.namespace, "snapshot");
        assert_eq!(config.journal.max_op_blocks, 32);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapfs.json");
        let mut config = FsConfig::default();
        config.refcount_capacity = Some(4096);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = FsConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.refcount_capacity, Some(4096));
        assert!(FsConfig::from_json_str("{ not json").is_err());
    }
}
