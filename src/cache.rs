//! Block cache for Strata
//!
//! Wraps any [`BlockDevice`] with a bounded in-memory cache. The eviction
//! policy is fixed at construction and only decides eviction order;
//! hit/miss accounting and dirty tracking are policy-independent.
//!
//! Entries live in an arena indexed by a block-number map. LRU and FIFO
//! share one index-based intrusive recency list (LRU promotes on access,
//! FIFO never does); LFU picks its victim by scanning access counters.
//!
//! One exclusive lock covers the map, the recency list, and the dirty
//! flags; every public operation holds it for its full duration. This is
//! a deliberate simplicity-over-throughput tradeoff.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::blockdev::{check_io, BlockDevice, BlockDeviceError};

/// Error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Block device error: {0}")]
    Device(#[from] BlockDeviceError),
    #[error("Cache is closed")]
    Closed,
    #[error("Cache capacity must be non-zero")]
    ZeroCapacity,
    #[error("Cache is full and no entry is evictable")]
    CacheFull,
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Eviction policy, selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry.
    Lru,
    /// Evict the entry with the smallest access count.
    Lfu,
    /// Evict the least recently inserted entry.
    Fifo,
}

/// Snapshot of cache counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    block: u64,
    data: Vec<u8>,
    dirty: bool,
    last_access: Instant,
    access_count: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<u64, usize>,
    slots: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    /// Most recently inserted/accessed entry.
    head: Option<usize>,
    /// Eviction candidate for LRU/FIFO.
    tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
    write_backs: u64,
    closed: bool,
}

/// A bounded write-back/write-through block cache over a device.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    policy: EvictionPolicy,
    max_size: usize,
    inner: Mutex<CacheInner>,
}

impl CacheInner {
    fn entry(&self, idx: usize) -> &CacheEntry {
        self.slots[idx].as_ref().expect("occupied cache slot")
    }

    fn entry_mut(&mut self, idx: usize) -> &mut CacheEntry {
        self.slots[idx].as_mut().expect("occupied cache slot")
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let e = self.entry_mut(idx);
        e.prev = None;
        e.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let e = self.entry_mut(idx);
            e.prev = None;
            e.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn touch(&mut self, idx: usize, policy: EvictionPolicy) {
        let e = self.entry_mut(idx);
        e.access_count += 1;
        e.last_access = Instant::now();
        if policy == EvictionPolicy::Lru {
            self.detach(idx);
            self.push_front(idx);
        }
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<usize> {
        match policy {
            EvictionPolicy::Lru | EvictionPolicy::Fifo => self.tail,
            EvictionPolicy::Lfu => self
                .map
                .values()
                .copied()
                .min_by_key(|&idx| self.entry(idx).access_count),
        }
    }

    /// Remove one entry according to `policy`, writing it back first if dirty.
    fn evict_one(&mut self, policy: EvictionPolicy, device: &dyn BlockDevice) -> Result<()> {
        let idx = self.victim(policy).ok_or(CacheError::CacheFull)?;
        self.write_back_if_dirty(idx, device)?;
        self.remove_slot(idx);
        self.evictions += 1;
        Ok(())
    }

    fn write_back_if_dirty(&mut self, idx: usize, device: &dyn BlockDevice) -> Result<()> {
        let (block, dirty) = {
            let e = self.entry(idx);
            (e.block, e.dirty)
        };
        if dirty {
            device.write_block(block, &self.entry(idx).data)?;
            self.entry_mut(idx).dirty = false;
            self.write_backs += 1;
        }
        Ok(())
    }

    fn remove_slot(&mut self, idx: usize) {
        self.detach(idx);
        let block = self.entry(idx).block;
        self.map.remove(&block);
        self.slots[idx] = None;
        self.free.push(idx);
    }

    fn insert(
        &mut self,
        block: u64,
        data: Vec<u8>,
        dirty: bool,
        policy: EvictionPolicy,
        max_size: usize,
        device: &dyn BlockDevice,
    ) -> Result<usize> {
        if self.map.len() >= max_size {
            self.evict_one(policy, device)?;
        }
        let entry = CacheEntry {
            block,
            data,
            dirty,
            last_access: Instant::now(),
            access_count: 1,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(block, idx);
        Ok(idx)
    }
}

impl BlockCache {
    /// Create a cache over `device` holding at most `max_size` blocks.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        policy: EvictionPolicy,
        max_size: usize,
    ) -> Result<Self> {
        if max_size == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            device,
            policy,
            max_size,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    fn check_open(inner: &CacheInner) -> Result<()> {
        if inner.closed {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Read a block, filling the cache on a miss.
    pub fn read(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_io(
            block,
            buf.len(),
            self.device.block_size(),
            self.device.block_count(),
        )?;
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;

        if let Some(&idx) = inner.map.get(&block) {
            inner.hits += 1;
            inner.touch(idx, self.policy);
            buf.copy_from_slice(&inner.entry(idx).data);
            return Ok(());
        }

        inner.misses += 1;
        let mut data = vec![0u8; self.device.block_size()];
        self.device.read_block(block, &mut data)?;
        buf.copy_from_slice(&data);
        inner.insert(
            block,
            data,
            false,
            self.policy,
            self.max_size,
            self.device.as_ref(),
        )?;
        Ok(())
    }

    /// Write a block into the cache and mark it dirty (deferred flush).
    pub fn write(&self, block: u64, data: &[u8]) -> Result<()> {
        check_io(
            block,
            data.len(),
            self.device.block_size(),
            self.device.block_count(),
        )?;
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;

        if let Some(&idx) = inner.map.get(&block) {
            inner.touch(idx, self.policy);
            let entry = inner.entry_mut(idx);
            entry.data.copy_from_slice(data);
            entry.dirty = true;
            return Ok(());
        }

        inner.insert(
            block,
            data.to_vec(),
            true,
            self.policy,
            self.max_size,
            self.device.as_ref(),
        )?;
        Ok(())
    }

    /// Alias for [`BlockCache::write`]; the flush is deferred.
    pub fn write_back(&self, block: u64, data: &[u8]) -> Result<()> {
        self.write(block, data)
    }

    /// Write a block and immediately flush that one block to the device.
    pub fn write_through(&self, block: u64, data: &[u8]) -> Result<()> {
        self.write(block, data)?;
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if let Some(&idx) = inner.map.get(&block) {
            inner.write_back_if_dirty(idx, self.device.as_ref())?;
        }
        Ok(())
    }

    /// Write all dirty entries through, then flush the device.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        self.flush_locked(&mut inner)?;
        self.device.flush()?;
        Ok(())
    }

    fn flush_locked(&self, inner: &mut CacheInner) -> Result<()> {
        let dirty: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&idx| inner.entry(idx).dirty)
            .collect();
        for idx in dirty {
            inner.write_back_if_dirty(idx, self.device.as_ref())?;
        }
        Ok(())
    }

    /// Drop one block from the cache, writing it back first if dirty.
    pub fn invalidate(&self, block: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if let Some(&idx) = inner.map.get(&block) {
            inner.write_back_if_dirty(idx, self.device.as_ref())?;
            inner.remove_slot(idx);
        }
        Ok(())
    }

    /// Drop every entry, writing dirty ones back first.
    pub fn invalidate_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        self.flush_locked(&mut inner)?;
        let indices: Vec<usize> = inner.map.values().copied().collect();
        for idx in indices {
            inner.remove_slot(idx);
        }
        Ok(())
    }

    /// Flush everything and release cache state. Terminal.
    ///
    /// This is the durability contract for callers that never call
    /// `flush` explicitly: no dirty entry is dropped unwritten.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        self.flush_locked(&mut inner)?;
        self.device.flush()?;
        let entries = inner.map.len();
        *inner = CacheInner {
            closed: true,
            ..CacheInner::default()
        };
        log::debug!("cache closed, {} entries released", entries);
        Ok(())
    }

    /// Populate the cache with blocks `start..start + count`, best-effort.
    ///
    /// Unreadable or out-of-range blocks are skipped, never surfaced.
    pub fn prefetch(&self, start: u64, count: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        for block in start..start.saturating_add(count) {
            if block >= self.device.block_count() || inner.map.contains_key(&block) {
                continue;
            }
            let mut data = vec![0u8; self.device.block_size()];
            match self.device.read_block(block, &mut data) {
                Ok(()) => {
                    inner.insert(
                        block,
                        data,
                        false,
                        self.policy,
                        self.max_size,
                        self.device.as_ref(),
                    )?;
                }
                Err(err) => {
                    log::debug!("prefetch skipping block {}: {}", block, err);
                }
            }
        }
        Ok(())
    }

    /// Return a cached block's data without touching recency or
    /// frequency metadata. `None` on a miss; peek never reads the device.
    pub fn peek(&self, block: u64) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(inner
            .map
            .get(&block)
            .map(|&idx| inner.entry(idx).data.clone()))
    }

    /// Current counters.
    pub fn stats(&self) -> Result<CacheStats> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            write_backs: inner.write_backs,
            entries: inner.map.len(),
            capacity: self.max_size,
        })
    }

    /// Policy chosen at construction.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    const BS: usize = 16;

    fn device(blocks: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemoryBlockDevice::new(BS, blocks).unwrap())
    }

    fn cache(dev: &Arc<dyn BlockDevice>, policy: EvictionPolicy, size: usize) -> BlockCache {
        BlockCache::new(dev.clone(), policy, size).unwrap()
    }

    #[test]
    fn write_is_deferred_until_flush() {
        let dev = device(4);
        let c = cache(&dev, EvictionPolicy::Lru, 4);

        let data = [0xABu8; BS];
        c.write(1, &data).unwrap();

        // Device still holds the old (zero) contents.
        let mut raw = [0xFFu8; BS];
        dev.read_block(1, &mut raw).unwrap();
        assert_eq!(raw, [0u8; BS]);

        // But the cache serves the new value.
        let mut buf = [0u8; BS];
        c.read(1, &mut buf).unwrap();
        assert_eq!(buf, data);

        c.flush().unwrap();
        dev.read_block(1, &mut raw).unwrap();
        assert_eq!(raw, data);
    }

    #[test]
    fn write_through_hits_device_immediately() {
        let dev = device(4);
        let c = cache(&dev, EvictionPolicy::Lru, 4);

        let data = [0x42u8; BS];
        c.write_through(2, &data).unwrap();

        let mut raw = [0u8; BS];
        dev.read_block(2, &mut raw).unwrap();
        assert_eq!(raw, data);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let dev = device(8);
        let c = cache(&dev, EvictionPolicy::Lru, 2);
        let mut buf = [0u8; BS];

        c.read(0, &mut buf).unwrap();
        c.read(1, &mut buf).unwrap();
        // Touch 0 so 1 becomes the LRU victim.
        c.read(0, &mut buf).unwrap();
        c.read(2, &mut buf).unwrap();

        assert!(c.peek(0).unwrap().is_some());
        assert!(c.peek(1).unwrap().is_none());
        assert!(c.peek(2).unwrap().is_some());
    }

    #[test]
    fn fifo_never_promotes() {
        let dev = device(8);
        let c = cache(&dev, EvictionPolicy::Fifo, 2);
        let mut buf = [0u8; BS];

        c.read(0, &mut buf).unwrap();
        c.read(1, &mut buf).unwrap();
        // Re-reading 0 must not save it: it is still the oldest insertion.
        c.read(0, &mut buf).unwrap();
        c.read(2, &mut buf).unwrap();

        assert!(c.peek(0).unwrap().is_none());
        assert!(c.peek(1).unwrap().is_some());
        assert!(c.peek(2).unwrap().is_some());
    }

    #[test]
    fn lfu_evicts_least_frequent() {
        let dev = device(8);
        let c = cache(&dev, EvictionPolicy::Lfu, 2);
        let mut buf = [0u8; BS];

        c.read(0, &mut buf).unwrap();
        c.read(0, &mut buf).unwrap();
        c.read(0, &mut buf).unwrap();
        c.read(1, &mut buf).unwrap();
        c.read(2, &mut buf).unwrap();

        assert!(c.peek(0).unwrap().is_some());
        assert!(c.peek(1).unwrap().is_none());
        assert!(c.peek(2).unwrap().is_some());
    }

    #[test]
    fn eviction_writes_dirty_victim_back() {
        let dev = device(8);
        let c = cache(&dev, EvictionPolicy::Lru, 1);

        let data = [0x77u8; BS];
        c.write(3, &data).unwrap();
        // Inserting another block evicts block 3, which must reach the device.
        c.write(4, &[0x11u8; BS]).unwrap();

        let mut raw = [0u8; BS];
        dev.read_block(3, &mut raw).unwrap();
        assert_eq!(raw, data);

        let stats = c.stats().unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.write_backs, 1);
    }

    #[test]
    fn resident_entries_never_exceed_capacity() {
        let dev = device(16);
        let c = cache(&dev, EvictionPolicy::Lru, 3);
        let mut buf = [0u8; BS];

        for block in 0..16 {
            c.read(block, &mut buf).unwrap();
            assert!(c.stats().unwrap().entries <= 3);
        }
    }

    #[test]
    fn peek_does_not_touch_metadata() {
        let dev = device(8);
        let c = cache(&dev, EvictionPolicy::Lru, 2);
        let mut buf = [0u8; BS];

        c.read(0, &mut buf).unwrap();
        c.read(1, &mut buf).unwrap();
        // Peeking 0 must not promote it; it stays the LRU victim.
        assert!(c.peek(0).unwrap().is_some());
        c.read(2, &mut buf).unwrap();

        assert!(c.peek(0).unwrap().is_none());
        assert!(c.peek(1).unwrap().is_some());
    }

    #[test]
    fn invalidate_writes_back_dirty_entry() {
        let dev = device(4);
        let c = cache(&dev, EvictionPolicy::Lru, 4);

        let data = [0x99u8; BS];
        c.write(0, &data).unwrap();
        c.invalidate(0).unwrap();

        assert!(c.peek(0).unwrap().is_none());
        let mut raw = [0u8; BS];
        dev.read_block(0, &mut raw).unwrap();
        assert_eq!(raw, data);
    }

    #[test]
    fn close_flushes_and_is_terminal() {
        let dev = device(4);
        let c = cache(&dev, EvictionPolicy::Fifo, 4);

        let data = [0x31u8; BS];
        c.write(2, &data).unwrap();
        c.close().unwrap();

        let mut raw = [0u8; BS];
        dev.read_block(2, &mut raw).unwrap();
        assert_eq!(raw, data);

        let mut buf = [0u8; BS];
        assert!(matches!(c.read(0, &mut buf), Err(CacheError::Closed)));
        assert!(matches!(c.close(), Err(CacheError::Closed)));
    }

    #[test]
    fn prefetch_is_best_effort() {
        let dev = device(4);
        let c = cache(&dev, EvictionPolicy::Lru, 8);

        // Range runs past the device end; out-of-range blocks are skipped.
        c.prefetch(2, 10).unwrap();
        assert!(c.peek(2).unwrap().is_some());
        assert!(c.peek(3).unwrap().is_some());
        assert_eq!(c.stats().unwrap().entries, 2);
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let dev = device(4);
        let c = cache(&dev, EvictionPolicy::Lru, 4);
        let mut buf = [0u8; BS];

        c.read(0, &mut buf).unwrap(); // miss
        c.read(0, &mut buf).unwrap(); // hit
        c.read(1, &mut buf).unwrap(); // miss

        let stats = c.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dev = device(4);
        assert!(matches!(
            BlockCache::new(dev, EvictionPolicy::Lru, 0),
            Err(CacheError::ZeroCapacity)
        ));
    }
}
