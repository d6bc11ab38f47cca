//! Block device I/O for SnapFS images and raw devices

mod blockdev_trait;
mod memory;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
pub(crate) use self::blockdev_trait::check_transfer;
pub use self::memory::MemBlockDevice;

/// A block device that is backed by an image file or a raw device node
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) an image file of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;
        log::debug!("BLOCKDEV: created image {} ({} bytes)", path.display(), size);

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count: size / BLOCK_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing image file or block device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::device_size(&path)?;
        log::debug!(
            "BLOCKDEV: opened {} ({} bytes, read_only={})",
            path.display(),
            size,
            read_only
        );

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count: size / BLOCK_SIZE as u64,
            read_only,
        })
    }

    /// Size in bytes of a regular file or block device
    fn device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::device_size_unix(path)
        }
        #[cfg(windows)]
        {
            Self::device_size_windows(path)
        }
    }

    #[cfg(unix)]
    fn device_size_unix(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = std::fs::File::open(path)?;
        // BLKGETSIZE64 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }
        Ok(size)
    }

    #[cfg(windows)]
    fn device_size_windows(path: &Path) -> Result<u64> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::GetFileSizeEx;
        use winapi::um::winnt::LARGE_INTEGER;

        let metadata = std::fs::metadata(path)?;
        if metadata.is_file() {
            return Ok(metadata.len());
        }

        let file = std::fs::File::open(path)?;
        let mut size: LARGE_INTEGER = unsafe { std::mem::zeroed() };
        unsafe {
            if GetFileSizeEx(file.as_raw_handle() as _, &mut size) != 0 {
                Ok(*size.QuadPart() as u64)
            } else {
                Ok(metadata.len())
            }
        }
    }

    /// Path this device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(block_num, self.block_count, buf.len())?;

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;
        let file = file_guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_transfer(block_num, self.block_count, data.len())?;

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;
        let file = file_guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;
        let file = file_guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        if !self.read_only {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;
        match file_guard.take() {
            Some(file) => {
                if !self.read_only {
                    file.sync_all().await?;
                }
                Ok(())
            }
            None => Err(BlockDeviceError::DeviceClosed),
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
