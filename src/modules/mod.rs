//! Strata feature modules
//!
//! Layered services built on top of the block device abstraction:
//! integrity checksums, write-ahead logging, RAID, and snapshots.

pub mod integrity;
pub mod raid;
pub mod snapshot;
pub mod wal;

// Re-export integrity helpers
pub use integrity::{block_checksum, verify_block, RotatingChecksum};

// Re-export WAL types
pub use wal::{RecoveryInfo, WalError, WalRecord, WalRecordType, WriteAheadLog};

// Re-export RAID types
pub use raid::{build_raid_array, RaidArray, RaidError, RaidLevel, RaidStatus};

// Re-export snapshot types
pub use snapshot::{
    Snapshot, SnapshotDiff, SnapshotError, SnapshotHandle, SnapshotManager,
};
