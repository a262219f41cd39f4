//! Write-back node cache
//!
//! LRU cache between the tree and the node files. Reads fill the cache,
//! writes only mark slots dirty; bytes reach the file when a dirty slot is
//! evicted, flushed, or the cache is closed. The whole structure sits behind
//! one mutex, which also orders the write-back I/O of an eviction before any
//! later access to the evicted id, so unlocked readers can never observe a
//! node image older than the last write.
//!
//! Eviction also notifies the backing via [`CacheBacking::release_entry`] so
//! that per-node bookkeeping (lock table entries) can be dropped alongside.

use crate::node::NodeId;
use crate::{Result, TreeError};
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing medium the cache fills from and spills to
pub trait CacheBacking: Send + Sync {
    /// Load the record for `id`
    fn load(&self, id: NodeId) -> Result<Vec<u8>>;

    /// Persist the record for `id`
    fn write_back(&self, id: NodeId, record: &[u8]) -> Result<()>;

    /// The cache no longer tracks `id`; drop any per-id bookkeeping
    fn release_entry(&self, id: NodeId);
}

/// Cached record plus its dirty flag
struct CacheSlot {
    record: Vec<u8>,
    dirty: bool,
}

/// Cache counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU write-back cache over a [`CacheBacking`]
pub struct NodeCache<B: CacheBacking> {
    inner: Mutex<LruCache<NodeId, CacheSlot>>,
    backing: B,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<B: CacheBacking> NodeCache<B> {
    /// Create a cache holding up to `capacity` node records
    pub fn new(capacity: usize, backing: B) -> Result<Self> {
        let cap = NonZeroUsize::new(capacity).ok_or_else(|| {
            TreeError::InvalidArgument("cache capacity must be non-zero".to_string())
        })?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(cap)),
            backing,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// The backing this cache spills to
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Fetch the record for `id`, filling from the backing on a miss
    pub fn get(&self, id: NodeId) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(slot.record.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let record = self.backing.load(id)?;
        let evicted = inner.push(
            id,
            CacheSlot {
                record: record.clone(),
                dirty: false,
            },
        );
        self.spill(id, evicted)?;
        Ok(record)
    }

    /// Install a new record for `id` and mark it dirty
    pub fn put(&self, id: NodeId, record: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        let evicted = inner.push(id, CacheSlot { record, dirty: true });
        self.spill(id, evicted)
    }

    /// Forget `id` without writing it back
    pub fn remove(&self, id: NodeId) {
        let dropped = self.inner.lock().pop(&id);
        if dropped.is_some() {
            self.backing.release_entry(id);
        }
    }

    /// Write every dirty slot back, keeping all entries cached
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for (id, slot) in inner.iter_mut() {
            if slot.dirty {
                self.backing.write_back(*id, &slot.record)?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Write back and drop every entry
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while let Some((id, slot)) = inner.pop_lru() {
            if slot.dirty {
                self.backing.write_back(id, &slot.record)?;
            }
            self.backing.release_entry(id);
        }
        Ok(())
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }

    /// Handle the return of `LruCache::push`: either the old slot under the
    /// same id (plain replacement) or the least recently used victim.
    fn spill(&self, inserted: NodeId, evicted: Option<(NodeId, CacheSlot)>) -> Result<()> {
        if let Some((victim, slot)) = evicted {
            if victim == inserted {
                return Ok(());
            }
            if slot.dirty {
                self.backing.write_back(victim, &slot.record)?;
            }
            self.backing.release_entry(victim);
            debug!("evicted node {} (dirty: {})", victim, slot.dirty);
        }
        Ok(())
    }
}
