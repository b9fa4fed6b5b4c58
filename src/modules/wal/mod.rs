//! Write-ahead log for Strata
//!
//! An append-only durability log of block writes and transaction
//! markers, independent of the live device chain. Records carry a
//! strictly increasing sequence number assigned by the log itself, a
//! checksum over every other field, and an optional commit watermark.
//!
//! On-disk format: a fixed 41-byte big-endian header
//! `sequence:u64 | type:u8 | block:u64 | data_len:u32 | timestamp:i64(ns)
//! | checksum:u32 | commit_seq:u64` followed by `data_len` payload bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::modules::integrity::block_checksum;

/// Fixed header size in bytes. The sum of the field widths below; there
/// is no padding.
pub const WAL_HEADER_SIZE: usize = 41;

/// WAL error types
#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAL closed")]
    Closed,
    #[error("WAL is corrupted at sequence {0}")]
    Corrupted(u64),
    #[error("Invalid record type {0}")]
    InvalidRecordType(u8),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Result type for WAL operations
pub type Result<T> = std::result::Result<T, WalError>;

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// A logged block write.
    Block = 1,
    /// Transaction begin marker.
    Begin = 2,
    /// Transaction end marker.
    End = 3,
    /// Commit marker; its `commit_seq` is the watermark it finalizes.
    Commit = 4,
    /// Recovery starting point.
    Checkpoint = 5,
}

impl WalRecordType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalRecordType::Block),
            2 => Ok(WalRecordType::Begin),
            3 => Ok(WalRecordType::End),
            4 => Ok(WalRecordType::Commit),
            5 => Ok(WalRecordType::Checkpoint),
            other => Err(WalError::InvalidRecordType(other)),
        }
    }
}

/// One WAL record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    /// Sequence number assigned by the log, strictly increasing.
    pub sequence: u64,
    pub record_type: WalRecordType,
    /// Target block for `Block` records; zero for markers.
    pub block: u64,
    pub data: Vec<u8>,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub checksum: u32,
    /// For `Commit`: highest record sequence the commit finalizes.
    /// For `End`: the matching `Begin` sequence.
    pub commit_seq: u64,
}

impl WalRecord {
    /// Checksum over every field except the checksum itself.
    fn compute_checksum(&self) -> u32 {
        let mut buf = Vec::with_capacity(WAL_HEADER_SIZE + self.data.len());
        // Header fields with the checksum position omitted.
        let _ = buf.write_u64::<BigEndian>(self.sequence);
        let _ = buf.write_u8(self.record_type as u8);
        let _ = buf.write_u64::<BigEndian>(self.block);
        let _ = buf.write_u32::<BigEndian>(self.data.len() as u32);
        let _ = buf.write_i64::<BigEndian>(self.timestamp);
        let _ = buf.write_u64::<BigEndian>(self.commit_seq);
        buf.extend_from_slice(&self.data);
        block_checksum(&buf)
    }

    /// Recompute and compare the stored checksum.
    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Serialize header + payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WAL_HEADER_SIZE + self.data.len());
        let _ = buf.write_u64::<BigEndian>(self.sequence);
        let _ = buf.write_u8(self.record_type as u8);
        let _ = buf.write_u64::<BigEndian>(self.block);
        let _ = buf.write_u32::<BigEndian>(self.data.len() as u32);
        let _ = buf.write_i64::<BigEndian>(self.timestamp);
        let _ = buf.write_u32::<BigEndian>(self.checksum);
        let _ = buf.write_u64::<BigEndian>(self.commit_seq);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse one record from `cursor`; `Ok(None)` at a clean end of input.
    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Option<Self>> {
        let remaining = cursor.get_ref().len() as u64 - cursor.position();
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < WAL_HEADER_SIZE as u64 {
            return Err(WalError::InvalidRecord(
                "truncated record header".to_string(),
            ));
        }
        let sequence = cursor.read_u64::<BigEndian>()?;
        let record_type = WalRecordType::from_u8(cursor.read_u8()?)?;
        let block = cursor.read_u64::<BigEndian>()?;
        let data_len = cursor.read_u32::<BigEndian>()? as usize;
        let timestamp = cursor.read_i64::<BigEndian>()?;
        let checksum = cursor.read_u32::<BigEndian>()?;
        let commit_seq = cursor.read_u64::<BigEndian>()?;
        let mut data = vec![0u8; data_len];
        cursor
            .read_exact(&mut data)
            .map_err(|_| WalError::InvalidRecord("truncated record payload".to_string()))?;
        Ok(Some(Self {
            sequence,
            record_type,
            block,
            data,
            timestamp,
            checksum,
            commit_seq,
        }))
    }
}

/// Summary computed by [`WriteAheadLog::recover`].
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    /// Highest sequence number in the log, zero if empty.
    pub last_sequence: u64,
    /// Highest commit watermark, zero if nothing was committed.
    pub last_commit_seq: u64,
    /// Sequence of the latest checkpoint marker, zero if none.
    pub checkpoint_seq: u64,
    /// `Block` records past the commit watermark, in sequence order.
    pub uncommitted: Vec<WalRecord>,
}

struct WalInner {
    file: Option<File>,
    records: Vec<WalRecord>,
    next_sequence: u64,
    /// Monotonic count of commits issued on this log.
    commit_count: u64,
    /// Highest record sequence finalized by a commit.
    committed_up_to: u64,
    checkpoint_seq: u64,
    corrupted: bool,
}

/// Append-only write-ahead log backed by a single file.
///
/// One exclusive lock guards sequence assignment, the in-memory record
/// list, and the file append, so sequence numbers are never reordered
/// or reused even under concurrent callers.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl WriteAheadLog {
    /// Open (or create) the log at `path`, scanning any existing records
    /// back into memory.
    ///
    /// A record with a bad checksum marks the log corrupted and stops
    /// the scan; a partial record at the tail (torn append) is discarded
    /// by truncating the file to the last whole record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut records = Vec::new();
        let mut corrupted = false;
        let mut valid_len = 0u64;
        let mut cursor = Cursor::new(contents.as_slice());
        loop {
            match WalRecord::read_from(&mut cursor) {
                Ok(Some(record)) => {
                    if !record.verify_checksum() {
                        log::warn!(
                            "WAL record {} failed checksum validation, marking log corrupted",
                            record.sequence
                        );
                        corrupted = true;
                        break;
                    }
                    valid_len = cursor.position();
                    records.push(record);
                }
                Ok(None) => break,
                Err(WalError::InvalidRecord(reason)) => {
                    log::warn!("discarding torn WAL tail: {}", reason);
                    break;
                }
                Err(WalError::InvalidRecordType(tag)) => {
                    log::warn!("WAL record with unknown type {}, marking log corrupted", tag);
                    corrupted = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if !corrupted && valid_len < contents.len() as u64 {
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        let next_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(1);
        let committed_up_to = records
            .iter()
            .filter(|r| r.record_type == WalRecordType::Commit)
            .map(|r| r.commit_seq)
            .max()
            .unwrap_or(0);
        let commit_count = records
            .iter()
            .filter(|r| r.record_type == WalRecordType::Commit)
            .count() as u64;
        let checkpoint_seq = records
            .iter()
            .filter(|r| r.record_type == WalRecordType::Checkpoint)
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0);

        if !records.is_empty() {
            log::info!(
                "opened WAL {} with {} records (next sequence {})",
                path.display(),
                records.len(),
                next_sequence
            );
        }

        Ok(Self {
            path,
            inner: Mutex::new(WalInner {
                file: Some(file),
                records,
                next_sequence,
                commit_count,
                committed_up_to,
                checkpoint_seq,
                corrupted,
            }),
        })
    }

    fn append_locked(
        inner: &mut WalInner,
        record_type: WalRecordType,
        block: u64,
        data: Vec<u8>,
        commit_seq: u64,
    ) -> Result<u64> {
        if inner.corrupted {
            return Err(WalError::Corrupted(inner.next_sequence));
        }
        let file = inner.file.as_mut().ok_or(WalError::Closed)?;

        let mut record = WalRecord {
            sequence: inner.next_sequence,
            record_type,
            block,
            data,
            timestamp: now_nanos(),
            checksum: 0,
            commit_seq,
        };
        record.checksum = record.compute_checksum();

        file.write_all(&record.to_bytes())?;
        inner.next_sequence += 1;
        let sequence = record.sequence;
        inner.records.push(record);
        Ok(sequence)
    }

    /// Append a logged block write; returns its sequence number.
    pub fn append_block(&self, block: u64, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::append_locked(&mut inner, WalRecordType::Block, block, data.to_vec(), 0)
    }

    /// Append a transaction begin marker; returns its sequence number,
    /// which identifies the transaction.
    pub fn begin_transaction(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::append_locked(&mut inner, WalRecordType::Begin, 0, Vec::new(), 0)
    }

    /// Append a transaction end marker referencing the begin sequence.
    pub fn end_transaction(&self, begin_seq: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::append_locked(&mut inner, WalRecordType::End, 0, Vec::new(), begin_seq)
    }

    /// Commit everything at or below `up_to_seq`.
    ///
    /// Appends a `Commit` record carrying `up_to_seq` as its watermark
    /// and bumps the monotonic commit counter.
    pub fn commit(&self, up_to_seq: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let sequence =
            Self::append_locked(&mut inner, WalRecordType::Commit, 0, Vec::new(), up_to_seq)?;
        inner.commit_count += 1;
        if up_to_seq > inner.committed_up_to {
            inner.committed_up_to = up_to_seq;
        }
        log::debug!("committed WAL up to sequence {}", up_to_seq);
        Ok(sequence)
    }

    /// Append a checkpoint marker recovery can start from.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let sequence = Self::append_locked(&mut inner, WalRecordType::Checkpoint, 0, Vec::new(), 0)?;
        inner.checkpoint_seq = sequence;
        if let Some(file) = inner.file.as_mut() {
            file.sync_all()?;
        }
        log::info!("WAL checkpoint at sequence {}", sequence);
        Ok(sequence)
    }

    /// `Block` records not yet covered by a commit watermark.
    pub fn uncommitted_records(&self) -> Result<Vec<WalRecord>> {
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(WalError::Closed);
        }
        Ok(Self::uncommitted_locked(&inner))
    }

    fn uncommitted_locked(inner: &WalInner) -> Vec<WalRecord> {
        inner
            .records
            .iter()
            .filter(|r| {
                r.record_type == WalRecordType::Block && r.sequence > inner.committed_up_to
            })
            .cloned()
            .collect()
    }

    /// Validate every retained record and summarize the log state.
    ///
    /// A checksum failure marks the log corrupted and is returned as an
    /// error; corrupt records are never handed to the caller as data.
    pub fn recover(&self) -> Result<RecoveryInfo> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(WalError::Closed);
        }
        if inner.corrupted {
            return Err(WalError::Corrupted(inner.next_sequence));
        }
        let bad_sequence = inner
            .records
            .iter()
            .find(|r| !r.verify_checksum())
            .map(|r| r.sequence);
        if let Some(sequence) = bad_sequence {
            inner.corrupted = true;
            log::warn!("WAL record {} failed checksum during recovery", sequence);
            return Err(WalError::Corrupted(sequence));
        }
        let info = RecoveryInfo {
            last_sequence: inner.next_sequence - 1,
            last_commit_seq: inner.committed_up_to,
            checkpoint_seq: inner.checkpoint_seq,
            uncommitted: Self::uncommitted_locked(&inner),
        };
        log::info!(
            "WAL recovery: last sequence {}, committed up to {}, {} uncommitted block records",
            info.last_sequence,
            info.last_commit_seq,
            info.uncommitted.len()
        );
        Ok(info)
    }

    /// Drop records at or below `up_to_seq` and reclaim their file bytes.
    ///
    /// Survivors are rewritten to a temp file in the log's directory
    /// which then atomically replaces the log.
    pub fn truncate(&self, up_to_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(WalError::Closed);
        }
        if inner.corrupted {
            return Err(WalError::Corrupted(inner.next_sequence));
        }

        let before = inner.records.len();
        inner.records.retain(|r| r.sequence > up_to_seq);

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        for record in &inner.records {
            tmp.write_all(&record.to_bytes())?;
        }
        tmp.as_file().sync_all()?;
        let file = tmp
            .persist(&self.path)
            .map_err(|e| WalError::Io(e.error))?;
        drop(file);

        let mut reopened = OpenOptions::new().read(true).write(true).open(&self.path)?;
        reopened.seek(SeekFrom::End(0))?;
        inner.file = Some(reopened);

        if inner.checkpoint_seq <= up_to_seq {
            inner.checkpoint_seq = 0;
        }
        log::debug!(
            "truncated WAL through sequence {} ({} records dropped)",
            up_to_seq,
            before - inner.records.len()
        );
        Ok(())
    }

    /// All retained records, in sequence order.
    pub fn records(&self) -> Result<Vec<WalRecord>> {
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(WalError::Closed);
        }
        Ok(inner.records.clone())
    }

    /// Sync the log file to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(WalError::Closed)?;
        file.sync_all()?;
        Ok(())
    }

    /// Close the log. Terminal; all further operations fail.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.file.take() {
            Some(file) => {
                file.sync_all()?;
                Ok(())
            }
            None => Err(WalError::Closed),
        }
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
