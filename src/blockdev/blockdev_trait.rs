//! Block device trait definitions for Strata

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number {block} (device has {count} blocks)")]
    InvalidBlockNumber { block: u64, count: u64 },
    #[error("Buffer length {len} does not match block size {block_size}")]
    BufferSizeMismatch { len: usize, block_size: usize },
    #[error("Invalid device geometry: {0}")]
    InvalidGeometry(String),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is closed")]
    DeviceClosed,
    #[error("Member device {0} has failed")]
    DeviceFailed(usize),
    #[error("No healthy member device can service the request")]
    NoHealthyDevice,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Concrete kind of a block device, fixed at construction.
///
/// Carried explicitly so callers never need runtime type inspection to
/// label a device (snapshot headers record it as a fixed-width string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Memory,
    File,
    ReadOnly,
    Encrypted,
    Compressed,
    Tiered,
    Raid0,
    Raid1,
    Raid5,
}

impl DeviceKind {
    /// Stable label, at most 16 bytes, used in on-disk headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Memory => "memory",
            DeviceKind::File => "file",
            DeviceKind::ReadOnly => "read-only",
            DeviceKind::Encrypted => "encrypted",
            DeviceKind::Compressed => "compressed",
            DeviceKind::Tiered => "tiered",
            DeviceKind::Raid0 => "raid0",
            DeviceKind::Raid1 => "raid1",
            DeviceKind::Raid5 => "raid5",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for fixed-geometry block device operations.
///
/// Every read/write payload must be exactly `block_size()` bytes and
/// address a block below `block_count()`. `close` is terminal: all
/// subsequent operations fail with [`BlockDeviceError::DeviceClosed`].
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `data`.
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Block size in bytes, fixed for the device's lifetime.
    fn block_size(&self) -> usize;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// Close the device. Terminal.
    fn close(&self) -> Result<()>;

    /// Kind tag assigned at construction.
    fn kind(&self) -> DeviceKind;
}

/// Validate a block number and payload length against a device's geometry.
pub(crate) fn check_io(block: u64, len: usize, block_size: usize, block_count: u64) -> Result<()> {
    if block >= block_count {
        return Err(BlockDeviceError::InvalidBlockNumber {
            block,
            count: block_count,
        });
    }
    if len != block_size {
        return Err(BlockDeviceError::BufferSizeMismatch { len, block_size });
    }
    Ok(())
}

/// Validate construction-time geometry.
pub(crate) fn check_geometry(block_size: usize, block_count: u64) -> Result<()> {
    if block_size == 0 {
        return Err(BlockDeviceError::InvalidGeometry(
            "block size must be non-zero".to_string(),
        ));
    }
    if block_count == 0 {
        return Err(BlockDeviceError::InvalidGeometry(
            "block count must be non-zero".to_string(),
        ));
    }
    Ok(())
}
