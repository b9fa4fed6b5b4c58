//! Block device backends for Strata
//!
//! Two concrete backends implement [`BlockDevice`]: an in-memory device
//! backed by a flat buffer and a file-backed device using positional I/O.
//! Decorator wrappers (read-only, encrypted, compressed, tiered) live in
//! [`wrappers`].

mod blockdev_trait;
pub mod wrappers;

use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, DeviceKind, Result};
pub(crate) use self::blockdev_trait::{check_geometry, check_io};

/// A block device backed entirely by process memory.
///
/// Blocks are zero-initialized. `flush` is a no-op; `close` only marks
/// the device closed.
pub struct MemoryBlockDevice {
    state: RwLock<MemoryState>,
    block_size: usize,
    block_count: u64,
}

struct MemoryState {
    buf: Vec<u8>,
    closed: bool,
}

impl MemoryBlockDevice {
    /// Create a new zero-filled memory device with the given geometry.
    pub fn new(block_size: usize, block_count: u64) -> Result<Self> {
        check_geometry(block_size, block_count)?;
        let bytes = (block_count as usize)
            .checked_mul(block_size)
            .ok_or_else(|| {
                BlockDeviceError::InvalidGeometry("device size overflows usize".to_string())
            })?;
        Ok(Self {
            state: RwLock::new(MemoryState {
                buf: vec![0u8; bytes],
                closed: false,
            }),
            block_size,
            block_count,
        })
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_io(block, buf.len(), self.block_size, self.block_count)?;
        let state = self.state.read();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        let start = block as usize * self.block_size;
        buf.copy_from_slice(&state.buf[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let mut state = self.state.write();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        let start = block as usize * self.block_size;
        state.buf[start..start + self.block_size].copy_from_slice(data);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn flush(&self) -> Result<()> {
        if self.state.read().closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        state.closed = true;
        state.buf = Vec::new();
        Ok(())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Memory
    }
}

/// A block device backed by a regular file.
///
/// Reads and writes use positional I/O at `block * block_size`; `flush`
/// fsyncs the file.
pub struct FileBlockDevice {
    file: RwLock<Option<File>>,
    path: PathBuf,
    block_size: usize,
    block_count: u64,
}

impl FileBlockDevice {
    /// Create a new device file sized to `block_count * block_size`.
    pub fn create(path: impl AsRef<Path>, block_size: usize, block_count: u64) -> Result<Self> {
        check_geometry(block_size, block_count)?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_count * block_size as u64)?;
        log::debug!(
            "created file device at {} ({} blocks of {} bytes)",
            path.display(),
            block_count,
            block_size
        );
        Ok(Self {
            file: RwLock::new(Some(file)),
            path,
            block_size,
            block_count,
        })
    }

    /// Open an existing device file, deriving the block count from its length.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(BlockDeviceError::InvalidGeometry(
                "block size must be non-zero".to_string(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let block_count = len / block_size as u64;
        if block_count == 0 {
            return Err(BlockDeviceError::InvalidGeometry(format!(
                "file {} is smaller than one block",
                path.display()
            )));
        }
        Ok(Self {
            file: RwLock::new(Some(file)),
            path,
            block_size,
            block_count,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_io(block, buf.len(), self.block_size, self.block_count)?;
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(BlockDeviceError::DeviceClosed)?;
        file.read_exact_at(buf, block * self.block_size as u64)?;
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let guard = self.file.write();
        let file = guard.as_ref().ok_or(BlockDeviceError::DeviceClosed)?;
        file.write_all_at(data, block * self.block_size as u64)?;
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn flush(&self) -> Result<()> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(BlockDeviceError::DeviceClosed)?;
        file.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.write();
        match guard.take() {
            Some(file) => {
                file.sync_all()?;
                Ok(())
            }
            None => Err(BlockDeviceError::DeviceClosed),
        }
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::File
    }
}
