//! Subcommand implementations

pub mod files;
pub mod format;
pub mod scrub;
pub mod snapshot;

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use snapfs::{FileBackedBlockDevice, FsConfig, Vfs};

/// Mount the filesystem in `image`
pub(crate) async fn open_vfs(image: &Path, config: FsConfig) -> Result<Vfs> {
    let device = FileBackedBlockDevice::open(image, false)
        .await
        .with_context(|| format!("Failed to open device: {}", image.display()))?;
    Vfs::mount(Arc::new(device), config)
        .await
        .with_context(|| format!("Failed to mount {}", image.display()))
}

/// Unmount `vfs` whether or not the command succeeded, reporting the command's error first
pub(crate) async fn finish(vfs: Vfs, result: Result<()>) -> Result<()> {
    let unmounted = vfs.shutdown().await.context("Failed to unmount");
    result?;
    unmounted
}

/// Ask a yes/no question on the terminal
pub(crate) fn confirm(prompt: &str, answer: &str) -> Result<bool> {
    print!("{} ", prompt);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(answer))
}

/// Human-readable byte count
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Render a Unix timestamp
pub(crate) fn format_time(secs: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
