//! Tests that verify state survives process-style restarts: every
//! durable structure is dropped and reopened from its files.

use std::sync::Arc;

use strata::{
    BlockDevice, FileBlockDevice, SnapshotManager, WalRecordType, WriteAheadLog,
};
use tempfile::TempDir;

fn init() {
    env_logger::builder().is_test(true).try_init().ok();
}

#[test]
fn file_device_contents_survive_reopen() {
    init();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("device.img");

    {
        let device = FileBlockDevice::create(&path, 64, 32).unwrap();
        for block in 0..32u64 {
            device.write_block(block, &[block as u8; 64]).unwrap();
        }
        device.flush().unwrap();
        device.close().unwrap();
    }

    let device = FileBlockDevice::open(&path, 64).unwrap();
    assert_eq!(device.block_count(), 32);
    let mut buf = [0u8; 64];
    for block in 0..32u64 {
        device.read_block(block, &mut buf).unwrap();
        assert_eq!(buf, [block as u8; 64]);
    }
}

#[test]
fn wal_counters_and_records_survive_reopen() {
    init();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("restart.wal");

    let (committed, pending) = {
        let wal = WriteAheadLog::open(&path).unwrap();
        wal.append_block(1, b"first").unwrap();
        let committed = wal.append_block(2, b"second").unwrap();
        wal.commit(committed).unwrap();
        let pending = wal.append_block(3, b"third").unwrap();
        wal.sync().unwrap();
        wal.close().unwrap();
        (committed, pending)
    };

    let wal = WriteAheadLog::open(&path).unwrap();
    let info = wal.recover().unwrap();
    assert_eq!(info.last_commit_seq, committed);
    assert_eq!(info.uncommitted.len(), 1);
    assert_eq!(info.uncommitted[0].sequence, pending);
    assert_eq!(info.uncommitted[0].data, b"third");

    // Sequences keep climbing from where the old instance stopped.
    let next = wal.append_block(4, b"fourth").unwrap();
    assert!(next > pending);

    let records = wal.records().unwrap();
    assert!(records
        .iter()
        .any(|r| r.record_type == WalRecordType::Commit && r.commit_seq == committed));
}

#[test]
fn wal_truncate_result_survives_reopen() {
    init();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("compact.wal");

    let keep_from = {
        let wal = WriteAheadLog::open(&path).unwrap();
        for block in 0..8u64 {
            wal.append_block(block, &[block as u8; 32]).unwrap();
        }
        let keep_from = 5;
        wal.commit(keep_from).unwrap();
        wal.truncate(keep_from).unwrap();
        wal.close().unwrap();
        keep_from
    };

    let wal = WriteAheadLog::open(&path).unwrap();
    let records = wal.records().unwrap();
    assert!(records
        .iter()
        .all(|r| r.sequence > keep_from || r.record_type != WalRecordType::Block));
    // Block records with sequences 6, 7, 8 survive the compaction.
    assert_eq!(
        records
            .iter()
            .filter(|r| r.record_type == WalRecordType::Block)
            .count(),
        3
    );
}

#[test]
fn snapshots_restore_through_a_fresh_manager() {
    init();

    let dir = TempDir::new().unwrap();
    let device_path = dir.path().join("disk.img");
    let snap_dir = dir.path().join("snapshots");

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::create(&device_path, 32, 16).unwrap());
    for block in 0..16u64 {
        device.write_block(block, &[0x42; 32]).unwrap();
    }

    let id = {
        let manager = SnapshotManager::new(device.clone(), &snap_dir, 8).unwrap();
        manager.create("golden", "known-good image").unwrap().id
    };

    // Scribble over the device, then restore via a brand-new manager.
    for block in 0..16u64 {
        device.write_block(block, &[0xDE; 32]).unwrap();
    }
    let manager = SnapshotManager::new(device.clone(), &snap_dir, 8).unwrap();
    let snapshot = manager.get(&id).unwrap();
    assert_eq!(snapshot.name, "golden");
    assert_eq!(snapshot.block_count, 16);
    assert!(manager.verify(&id).unwrap());

    manager.restore(&id).unwrap();
    let mut buf = [0u8; 32];
    for block in 0..16u64 {
        device.read_block(block, &mut buf).unwrap();
        assert_eq!(buf, [0x42; 32]);
    }
}
