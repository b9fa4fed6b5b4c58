//! Snapshots for Strata
//!
//! Point-in-time full copies of a device's contents to a side store.
//! Each snapshot is one data file (a fixed 256-byte header followed by
//! every block in ascending order) plus a JSON metadata side file. The
//! registry is reloaded from the side store on construction, so
//! snapshots survive process restarts.
//!
//! "Incremental" snapshots store a full copy too: the diff against the
//! parent is computed and recorded, but storage is not reduced.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, DeviceKind};
use crate::modules::integrity::RotatingChecksum;

const SNAPSHOT_MAGIC: &[u8; 8] = b"SNAPSHOT";
const SNAPSHOT_VERSION: u16 = 1;
const DEVICE_TYPE_LEN: usize = 16;

/// Fixed size of the on-disk snapshot header.
pub const SNAPSHOT_HEADER_SIZE: usize = 256;

/// Snapshot error types
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block device error: {0}")]
    Device(#[from] BlockDeviceError),
    #[error("Snapshot not found: {0}")]
    NotFound(String),
    #[error("Snapshot {0} is open")]
    InUse(String),
    #[error("Snapshot limit of {0} reached")]
    LimitReached(usize),
    #[error("Corrupt snapshot header: {0}")]
    CorruptHeader(String),
    #[error("Snapshot block size {snapshot} does not match device block size {device}")]
    GeometryMismatch { snapshot: u32, device: usize },
    #[error("Snapshot metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Snapshot id, name, and description exceed the header budget ({0} bytes over)")]
    MetadataTooLarge(usize),
}

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Snapshot metadata, persisted as a JSON side file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub device_kind: DeviceKind,
    pub block_size: u32,
    pub block_count: u64,
    /// Total data file size: header plus all blocks.
    pub size_bytes: u64,
    /// Rotating checksum over every stored block byte.
    pub checksum: u32,
    /// Parent snapshot for incremental creation, if any.
    pub parent_id: Option<String>,
}

/// Derived, non-persistent comparison between two snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotDiff {
    pub from_id: String,
    pub to_id: String,
    /// Blocks present only in `to`.
    pub added: BTreeSet<u64>,
    /// Blocks present only in `from`.
    pub removed: BTreeSet<u64>,
    /// Blocks present in both with different bytes.
    pub modified: BTreeSet<u64>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn changed_blocks(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

fn encode_header(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let fixed = SNAPSHOT_MAGIC.len() + 2 + 4 + 8 + 8 + 3 + DEVICE_TYPE_LEN;
    let variable = snapshot.id.len() + snapshot.name.len() + snapshot.description.len();
    if fixed + variable > SNAPSHOT_HEADER_SIZE {
        return Err(SnapshotError::MetadataTooLarge(
            fixed + variable - SNAPSHOT_HEADER_SIZE,
        ));
    }
    // Each string length is stored in one byte.
    for value in [&snapshot.id, &snapshot.name, &snapshot.description] {
        if value.len() > u8::MAX as usize {
            return Err(SnapshotError::MetadataTooLarge(
                value.len() - u8::MAX as usize,
            ));
        }
    }

    let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_SIZE);
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    let _ = buf.write_u16::<BigEndian>(SNAPSHOT_VERSION);
    let _ = buf.write_u32::<BigEndian>(snapshot.block_size);
    let _ = buf.write_u64::<BigEndian>(snapshot.block_count);
    let created_ns = snapshot
        .created_at
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    let _ = buf.write_u64::<BigEndian>(created_ns);
    let _ = buf.write_u8(snapshot.id.len() as u8);
    buf.extend_from_slice(snapshot.id.as_bytes());
    let _ = buf.write_u8(snapshot.name.len() as u8);
    buf.extend_from_slice(snapshot.name.as_bytes());
    let _ = buf.write_u8(snapshot.description.len() as u8);
    buf.extend_from_slice(snapshot.description.as_bytes());
    let mut device_type = [0u8; DEVICE_TYPE_LEN];
    let label = snapshot.device_kind.as_str().as_bytes();
    device_type[..label.len()].copy_from_slice(label);
    buf.extend_from_slice(&device_type);
    buf.resize(SNAPSHOT_HEADER_SIZE, 0);
    Ok(buf)
}

/// Fields recovered from an on-disk header.
struct ParsedHeader {
    block_size: u32,
    block_count: u64,
    id: String,
}

fn read_header_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| SnapshotError::CorruptHeader("non-UTF-8 string field".to_string()))
}

fn decode_header(buf: &[u8]) -> Result<ParsedHeader> {
    if buf.len() < SNAPSHOT_HEADER_SIZE {
        return Err(SnapshotError::CorruptHeader("header truncated".to_string()));
    }
    if &buf[..8] != SNAPSHOT_MAGIC {
        return Err(SnapshotError::CorruptHeader("bad magic".to_string()));
    }
    let mut cursor = Cursor::new(&buf[8..]);
    let version = cursor.read_u16::<BigEndian>()?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::CorruptHeader(format!(
            "unsupported version {}",
            version
        )));
    }
    let block_size = cursor.read_u32::<BigEndian>()?;
    let block_count = cursor.read_u64::<BigEndian>()?;
    let _created_ns = cursor.read_u64::<BigEndian>()?;
    let id = read_header_string(&mut cursor)?;
    let _name = read_header_string(&mut cursor)?;
    let _description = read_header_string(&mut cursor)?;
    Ok(ParsedHeader {
        block_size,
        block_count,
        id,
    })
}

/// Read a stored block, zero-filling if the data stream is short.
fn read_stored_block(file: &File, block_size: usize, block: u64, buf: &mut [u8]) -> io::Result<()> {
    let offset = SNAPSHOT_HEADER_SIZE as u64 + block * block_size as u64;
    match file.read_exact_at(buf, offset) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            buf.fill(0);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

struct Registry {
    snapshots: BTreeMap<String, Snapshot>,
    open: HashSet<String>,
    last_id_nanos: u64,
}

/// Manages point-in-time snapshots of one live device.
///
/// One exclusive lock guards the registry and the open set; the block
/// copy loops of `create`/`restore`/`diff` run while holding it, so one
/// snapshot operation proceeds at a time. There is no cancellation
/// point: callers needing deadlines must wrap calls externally.
pub struct SnapshotManager {
    device: Arc<dyn BlockDevice>,
    dir: PathBuf,
    max_snapshots: usize,
    registry: Arc<Mutex<Registry>>,
}

/// Exclusive read handle over one snapshot's stored image.
///
/// Dropping the handle releases the open mark, allowing the snapshot
/// to be opened or deleted again.
pub struct SnapshotHandle {
    file: File,
    snapshot: Snapshot,
    registry: Arc<Mutex<Registry>>,
}

impl SnapshotHandle {
    /// Read one stored block; short streams read as zeros.
    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        if block >= self.snapshot.block_count {
            return Err(SnapshotError::Device(
                BlockDeviceError::InvalidBlockNumber {
                    block,
                    count: self.snapshot.block_count,
                },
            ));
        }
        if buf.len() != self.snapshot.block_size as usize {
            return Err(SnapshotError::Device(BlockDeviceError::BufferSizeMismatch {
                len: buf.len(),
                block_size: self.snapshot.block_size as usize,
            }));
        }
        read_stored_block(&self.file, self.snapshot.block_size as usize, block, buf)?;
        Ok(())
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.registry.lock().open.remove(&self.snapshot.id);
    }
}

impl SnapshotManager {
    /// Create a manager over `device` storing snapshots under `dir`,
    /// reloading any metadata side files already there.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        dir: impl AsRef<Path>,
        max_snapshots: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut snapshots = BTreeMap::new();
        let mut last_id_nanos = 0u64;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<Snapshot>(&contents) {
                Ok(snapshot) => {
                    if let Some(nanos) = snapshot
                        .id
                        .strip_prefix("snap-")
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        last_id_nanos = last_id_nanos.max(nanos);
                    }
                    snapshots.insert(snapshot.id.clone(), snapshot);
                }
                Err(err) => {
                    log::warn!("skipping unreadable metadata {}: {}", path.display(), err);
                }
            }
        }
        if !snapshots.is_empty() {
            log::info!(
                "loaded {} snapshots from {}",
                snapshots.len(),
                dir.display()
            );
        }

        Ok(Self {
            device,
            dir,
            max_snapshots,
            registry: Arc::new(Mutex::new(Registry {
                snapshots,
                open: HashSet::new(),
                last_id_nanos,
            })),
        })
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.snap", id))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", id))
    }

    fn allocate_id(registry: &mut Registry) -> String {
        let mut nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        if nanos <= registry.last_id_nanos {
            nanos = registry.last_id_nanos + 1;
        }
        registry.last_id_nanos = nanos;
        format!("snap-{}", nanos)
    }

    /// Capture a full point-in-time copy of the device.
    pub fn create(&self, name: &str, description: &str) -> Result<Snapshot> {
        let mut registry = self.registry.lock();
        self.create_locked(&mut registry, name, description, None)
    }

    fn create_locked(
        &self,
        registry: &mut Registry,
        name: &str,
        description: &str,
        parent_id: Option<String>,
    ) -> Result<Snapshot> {
        if registry.snapshots.len() >= self.max_snapshots {
            return Err(SnapshotError::LimitReached(self.max_snapshots));
        }
        let id = Self::allocate_id(registry);
        let block_size = self.device.block_size();
        let block_count = self.device.block_count();
        let mut snapshot = Snapshot {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            device_kind: self.device.kind(),
            block_size: block_size as u32,
            block_count,
            size_bytes: SNAPSHOT_HEADER_SIZE as u64 + block_count * block_size as u64,
            checksum: 0,
            parent_id,
        };

        match self.write_snapshot_files(&mut snapshot) {
            Ok(()) => {
                log::info!(
                    "created snapshot {} ('{}'), {} blocks",
                    snapshot.id,
                    snapshot.name,
                    snapshot.block_count
                );
                registry.snapshots.insert(id, snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                // Never leave a half-written snapshot registered or on disk.
                let _ = fs::remove_file(self.data_path(&snapshot.id));
                let _ = fs::remove_file(self.meta_path(&snapshot.id));
                Err(err)
            }
        }
    }

    fn write_snapshot_files(&self, snapshot: &mut Snapshot) -> Result<()> {
        let header = encode_header(snapshot)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.data_path(&snapshot.id))?;
        file.write_all_at(&header, 0)?;

        let block_size = snapshot.block_size as usize;
        let mut buf = vec![0u8; block_size];
        let mut checksum = RotatingChecksum::new();
        for block in 0..snapshot.block_count {
            self.device.read_block(block, &mut buf)?;
            checksum.update(&buf);
            let offset = SNAPSHOT_HEADER_SIZE as u64 + block * block_size as u64;
            file.write_all_at(&buf, offset)?;
        }
        file.sync_all()?;
        snapshot.checksum = checksum.value();

        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(self.meta_path(&snapshot.id), json)?;
        Ok(())
    }

    /// Open a snapshot for reading. Exclusive: a second `open` of the
    /// same snapshot fails with [`SnapshotError::InUse`] until the
    /// handle is dropped.
    pub fn open(&self, id: &str) -> Result<SnapshotHandle> {
        let mut registry = self.registry.lock();
        let snapshot = registry
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        if !registry.open.insert(id.to_string()) {
            return Err(SnapshotError::InUse(id.to_string()));
        }
        match self.open_validated(&snapshot) {
            Ok(file) => Ok(SnapshotHandle {
                file,
                snapshot,
                registry: Arc::clone(&self.registry),
            }),
            Err(err) => {
                registry.open.remove(id);
                Err(err)
            }
        }
    }

    fn open_validated(&self, snapshot: &Snapshot) -> Result<File> {
        let file = File::open(self.data_path(&snapshot.id))?;
        let mut header = vec![0u8; SNAPSHOT_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)
            .map_err(|_| SnapshotError::CorruptHeader("header truncated".to_string()))?;
        let parsed = decode_header(&header)?;
        if parsed.id != snapshot.id {
            return Err(SnapshotError::CorruptHeader(format!(
                "header id {} does not match {}",
                parsed.id, snapshot.id
            )));
        }
        if parsed.block_size != snapshot.block_size || parsed.block_count != snapshot.block_count {
            return Err(SnapshotError::CorruptHeader(format!(
                "header geometry {}x{} does not match metadata {}x{}",
                parsed.block_count, parsed.block_size, snapshot.block_count, snapshot.block_size
            )));
        }
        Ok(file)
    }

    /// Write a snapshot's stored blocks back to the live device.
    /// Destructive to the device's current contents.
    pub fn restore(&self, id: &str) -> Result<()> {
        let registry = self.registry.lock();
        let snapshot = registry
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        if snapshot.block_size as usize != self.device.block_size() {
            return Err(SnapshotError::GeometryMismatch {
                snapshot: snapshot.block_size,
                device: self.device.block_size(),
            });
        }
        let file = self.open_validated(&snapshot)?;

        let block_size = snapshot.block_size as usize;
        let mut buf = vec![0u8; block_size];
        let blocks = snapshot.block_count.min(self.device.block_count());
        for block in 0..blocks {
            read_stored_block(&file, block_size, block, &mut buf)?;
            self.device.write_block(block, &buf)?;
        }
        self.device.flush()?;
        log::info!("restored snapshot {} ({} blocks)", id, blocks);
        Ok(())
    }

    /// Delete a snapshot's data and metadata. Rejected while it is open.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.open.contains(id) {
            return Err(SnapshotError::InUse(id.to_string()));
        }
        if registry.snapshots.remove(id).is_none() {
            return Err(SnapshotError::NotFound(id.to_string()));
        }
        fs::remove_file(self.data_path(id))?;
        fs::remove_file(self.meta_path(id))?;
        log::info!("deleted snapshot {}", id);
        Ok(())
    }

    /// All snapshots, oldest first.
    pub fn list(&self) -> Vec<Snapshot> {
        let registry = self.registry.lock();
        let mut all: Vec<Snapshot> = registry.snapshots.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Look up one snapshot's metadata.
    pub fn get(&self, id: &str) -> Option<Snapshot> {
        self.registry.lock().snapshots.get(id).cloned()
    }

    /// Block-by-block comparison of two snapshots.
    pub fn diff(&self, from_id: &str, to_id: &str) -> Result<SnapshotDiff> {
        let registry = self.registry.lock();
        self.diff_locked(&registry, from_id, to_id)
    }

    fn diff_locked(&self, registry: &Registry, from_id: &str, to_id: &str) -> Result<SnapshotDiff> {
        let from = registry
            .snapshots
            .get(from_id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(from_id.to_string()))?;
        let to = registry
            .snapshots
            .get(to_id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(to_id.to_string()))?;

        let from_file = self.open_validated(&from)?;
        let to_file = self.open_validated(&to)?;

        let block_size = from.block_size as usize;
        let mut diff = SnapshotDiff {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            modified: BTreeSet::new(),
        };
        let mut from_buf = vec![0u8; block_size];
        let mut to_buf = vec![0u8; to.block_size as usize];
        for block in 0..from.block_count.max(to.block_count) {
            let in_from = block < from.block_count;
            let in_to = block < to.block_count;
            match (in_from, in_to) {
                (true, false) => {
                    diff.removed.insert(block);
                }
                (false, true) => {
                    diff.added.insert(block);
                }
                (true, true) => {
                    read_stored_block(&from_file, block_size, block, &mut from_buf)?;
                    read_stored_block(&to_file, to.block_size as usize, block, &mut to_buf)?;
                    if from_buf != to_buf {
                        diff.modified.insert(block);
                    }
                }
                (false, false) => {}
            }
        }
        Ok(diff)
    }

    /// Create a snapshot recording its diff against `parent_id`.
    ///
    /// The new snapshot's data file is still a full copy; only the diff
    /// metadata distinguishes it from [`SnapshotManager::create`].
    pub fn create_incremental(
        &self,
        parent_id: &str,
        name: &str,
        description: &str,
    ) -> Result<(Snapshot, SnapshotDiff)> {
        let mut registry = self.registry.lock();
        if !registry.snapshots.contains_key(parent_id) {
            return Err(SnapshotError::NotFound(parent_id.to_string()));
        }
        let snapshot =
            self.create_locked(&mut registry, name, description, Some(parent_id.to_string()))?;
        let diff = self.diff_locked(&registry, parent_id, &snapshot.id)?;
        Ok((snapshot, diff))
    }

    /// Recompute the stored data checksum and compare with the metadata.
    pub fn verify(&self, id: &str) -> Result<bool> {
        let registry = self.registry.lock();
        let snapshot = registry
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let file = self.open_validated(&snapshot)?;

        let block_size = snapshot.block_size as usize;
        let mut buf = vec![0u8; block_size];
        let mut checksum = RotatingChecksum::new();
        for block in 0..snapshot.block_count {
            read_stored_block(&file, block_size, block, &mut buf)?;
            checksum.update(&buf);
        }
        Ok(checksum.value() == snapshot.checksum)
    }

    /// Side-store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use tempfile::tempdir;

    const BS: usize = 32;

    fn device(blocks: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemoryBlockDevice::new(BS, blocks).unwrap())
    }

    fn fill(dev: &Arc<dyn BlockDevice>, seed: u8) {
        for block in 0..dev.block_count() {
            dev.write_block(block, &vec![seed.wrapping_add(block as u8); BS])
                .unwrap();
        }
    }

    #[test]
    fn create_restore_round_trip() {
        let dir = tempdir().unwrap();
        let dev = device(8);
        fill(&dev, 10);

        let manager = SnapshotManager::new(dev.clone(), dir.path(), 16).unwrap();
        let snapshot = manager.create("before", "known state").unwrap();
        assert_eq!(snapshot.block_count, 8);

        // Mutate the live device arbitrarily.
        fill(&dev, 200);
        dev.write_block(3, &[0xEE; BS]).unwrap();

        manager.restore(&snapshot.id).unwrap();
        for block in 0..8u64 {
            let mut buf = [0u8; BS];
            dev.read_block(block, &mut buf).unwrap();
            assert_eq!(buf, [10u8.wrapping_add(block as u8); BS]);
        }
    }

    #[test]
    fn snapshot_limit_is_enforced() {
        let dir = tempdir().unwrap();
        let dev = device(2);
        let manager = SnapshotManager::new(dev, dir.path(), 2).unwrap();

        manager.create("a", "").unwrap();
        manager.create("b", "").unwrap();
        assert!(matches!(
            manager.create("c", ""),
            Err(SnapshotError::LimitReached(2))
        ));
    }

    #[test]
    fn ids_are_unique_and_time_ordered() {
        let dir = tempdir().unwrap();
        let dev = device(2);
        let manager = SnapshotManager::new(dev, dir.path(), 16).unwrap();

        let a = manager.create("a", "").unwrap();
        let b = manager.create("b", "").unwrap();
        let c = manager.create("c", "").unwrap();
        assert!(a.id < b.id && b.id < c.id);

        let ids: Vec<String> = manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn open_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let dev = device(4);
        fill(&dev, 1);
        let manager = SnapshotManager::new(dev, dir.path(), 16).unwrap();
        let snapshot = manager.create("s", "").unwrap();

        let handle = manager.open(&snapshot.id).unwrap();
        assert!(matches!(
            manager.open(&snapshot.id),
            Err(SnapshotError::InUse(_))
        ));

        let mut buf = [0u8; BS];
        handle.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, [3u8; BS]);

        drop(handle);
        let reopened = manager.open(&snapshot.id).unwrap();
        drop(reopened);
    }

    #[test]
    fn delete_rejected_while_open() {
        let dir = tempdir().unwrap();
        let dev = device(2);
        let manager = SnapshotManager::new(dev, dir.path(), 16).unwrap();
        let snapshot = manager.create("s", "").unwrap();

        let handle = manager.open(&snapshot.id).unwrap();
        assert!(matches!(
            manager.delete(&snapshot.id),
            Err(SnapshotError::InUse(_))
        ));
        drop(handle);

        manager.delete(&snapshot.id).unwrap();
        assert!(manager.get(&snapshot.id).is_none());
        assert!(!dir.path().join(format!("{}.snap", snapshot.id)).exists());
        assert!(!dir
            .path()
            .join(format!("{}.meta.json", snapshot.id))
            .exists());
        assert!(matches!(
            manager.delete(&snapshot.id),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn diff_classifies_modified_blocks() {
        let dir = tempdir().unwrap();
        let dev = device(8);
        fill(&dev, 0);
        let manager = SnapshotManager::new(dev.clone(), dir.path(), 16).unwrap();

        let before = manager.create("before", "").unwrap();
        dev.write_block(2, &[0xAB; BS]).unwrap();
        dev.write_block(5, &[0xCD; BS]).unwrap();
        let after = manager.create("after", "").unwrap();

        let diff = manager.diff(&before.id, &after.id).unwrap();
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(
            diff.modified.iter().copied().collect::<Vec<u64>>(),
            vec![2, 5]
        );
        assert_eq!(diff.changed_blocks(), 2);
    }

    #[test]
    fn incremental_records_parent_and_diff() {
        let dir = tempdir().unwrap();
        let dev = device(4);
        fill(&dev, 7);
        let manager = SnapshotManager::new(dev.clone(), dir.path(), 16).unwrap();

        let parent = manager.create("parent", "").unwrap();
        dev.write_block(1, &[0x44; BS]).unwrap();

        let (child, diff) = manager
            .create_incremental(&parent.id, "child", "after change")
            .unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(
            diff.modified.iter().copied().collect::<Vec<u64>>(),
            vec![1]
        );

        // The child still stores a full copy.
        assert_eq!(
            child.size_bytes,
            SNAPSHOT_HEADER_SIZE as u64 + 4 * BS as u64
        );
    }

    #[test]
    fn incremental_requires_existing_parent() {
        let dir = tempdir().unwrap();
        let dev = device(2);
        let manager = SnapshotManager::new(dev, dir.path(), 16).unwrap();
        assert!(matches!(
            manager.create_incremental("snap-0", "x", ""),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn registry_reloads_from_side_store() {
        let dir = tempdir().unwrap();
        let dev = device(4);
        fill(&dev, 3);

        let id = {
            let manager = SnapshotManager::new(dev.clone(), dir.path(), 16).unwrap();
            manager.create("persisted", "survives restart").unwrap().id
        };

        fill(&dev, 150);
        let manager = SnapshotManager::new(dev.clone(), dir.path(), 16).unwrap();
        let snapshot = manager.get(&id).unwrap();
        assert_eq!(snapshot.name, "persisted");

        manager.restore(&id).unwrap();
        let mut buf = [0u8; BS];
        dev.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, [3u8; BS]);

        // A new id must not collide with the reloaded one.
        let fresh = manager.create("fresh", "").unwrap();
        assert_ne!(fresh.id, id);
    }

    #[test]
    fn verify_detects_tampered_data() {
        let dir = tempdir().unwrap();
        let dev = device(4);
        fill(&dev, 9);
        let manager = SnapshotManager::new(dev, dir.path(), 16).unwrap();
        let snapshot = manager.create("s", "").unwrap();
        assert!(manager.verify(&snapshot.id).unwrap());

        // Flip one stored byte past the header.
        let path = dir.path().join(format!("{}.snap", snapshot.id));
        let mut contents = std::fs::read(&path).unwrap();
        let idx = SNAPSHOT_HEADER_SIZE + 5;
        contents[idx] ^= 0xFF;
        std::fs::write(&path, contents).unwrap();

        assert!(!manager.verify(&snapshot.id).unwrap());
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempdir().unwrap();
        let dev = device(2);
        let manager = SnapshotManager::new(dev, dir.path(), 16).unwrap();
        let snapshot = manager.create("s", "").unwrap();

        let path = dir.path().join(format!("{}.snap", snapshot.id));
        let mut contents = std::fs::read(&path).unwrap();
        contents[0] = b'X'; // break the magic
        std::fs::write(&path, contents).unwrap();

        assert!(matches!(
            manager.open(&snapshot.id),
            Err(SnapshotError::CorruptHeader(_))
        ));
        assert!(matches!(
            manager.restore(&snapshot.id),
            Err(SnapshotError::CorruptHeader(_))
        ));
    }
}
