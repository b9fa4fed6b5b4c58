//! Crate-wide error type
//!
//! Each subsystem defines its own error enum; this umbrella type lets
//! callers stack layers (cache over RAID over files, with a WAL and
//! snapshots on the side) behind one `Result`.

use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::cache::CacheError;
use crate::modules::raid::RaidError;
use crate::modules::snapshot::SnapshotError;
use crate::modules::wal::WalError;

/// Any error the storage engine can produce.
#[derive(Error, Debug)]
pub enum Error {
    /// Block device failure
    #[error(transparent)]
    Device(#[from] BlockDeviceError),

    /// Block cache failure
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Write-ahead log failure
    #[error(transparent)]
    Wal(#[from] WalError),

    /// RAID array failure
    #[error(transparent)]
    Raid(#[from] RaidError),

    /// Snapshot failure
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Plain I/O failure outside any subsystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the crate-wide [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
