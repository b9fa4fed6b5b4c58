//! Strata Core - A layered block storage engine
//!
//! This crate provides the building blocks of a block storage stack:
//! the [`BlockDevice`] abstraction with memory and file backends,
//! device wrappers (read-only, encrypted, compressed, tiered), a
//! policy-driven [`BlockCache`], a [`WriteAheadLog`], software RAID
//! levels 0/1/5, and a [`SnapshotManager`].
//!
//! All APIs are synchronous and blocking. Every layer implements
//! [`BlockDevice`], so layers compose freely: a cache over a RAID 5
//! array of file devices is just nesting.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod blockdev;
pub mod cache;
pub mod error;
pub mod modules;

// Re-export the device layer
pub use blockdev::{
    BlockDevice, BlockDeviceError, DeviceKind, FileBlockDevice, MemoryBlockDevice,
};
pub use blockdev::wrappers::{
    CompressedDevice, ReadOnlyDevice, Tier, TieredDevice, XorEncryptedDevice,
};

// Re-export the cache layer
pub use cache::{BlockCache, CacheError, CacheStats, EvictionPolicy};

// Re-export the feature modules
pub use modules::raid::{build_raid_array, RaidArray, RaidError, RaidLevel, RaidStatus};
pub use modules::snapshot::{Snapshot, SnapshotError, SnapshotHandle, SnapshotManager};
pub use modules::wal::{RecoveryInfo, WalError, WalRecord, WalRecordType, WriteAheadLog};

// Re-export the umbrella error type
pub use error::{Error, Result};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, DeviceKind};
    pub use crate::cache::{BlockCache, EvictionPolicy};
    pub use crate::error::{Error, Result};
    pub use crate::modules::raid::{build_raid_array, RaidArray, RaidLevel};
    pub use crate::modules::snapshot::SnapshotManager;
    pub use crate::modules::wal::WriteAheadLog;
}
