//! Per-node lock registry
//!
//! Writers own at most a couple of nodes at a time, so locks live in a
//! sharded table keyed by node id rather than inside the nodes. An entry is
//! a tiny mutex/condvar pair plus a pin count; create-or-pin and
//! unpin-and-maybe-remove both run under the owning shard lock, so an entry
//! can never be removed while any thread still references it, and the table
//! shrinks back to the contended set on its own.
//!
//! ## Protocol
//! - `lock` blocks until the node is free, then records the owning thread
//! - `unlock` by a thread that does not hold the lock is an error, as is
//!   re-locking a node the thread already holds
//! - `count_locked` is a diagnostic; quiescent trees report zero

use crate::node::NodeId;
use crate::{Result, TreeError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// One lock: owner slot, wait queue, pin count
#[derive(Default)]
struct LockEntry {
    /// Owning thread, `None` when free
    state: Mutex<Option<ThreadId>>,

    /// Signalled when the owner releases
    available: Condvar,

    /// Threads currently referencing this entry
    pins: AtomicUsize,
}

/// Blocking exclusive locks keyed by node id
pub struct NodeLockRegistry {
    entries: DashMap<NodeId, Arc<LockEntry>>,
    held: AtomicUsize,
}

impl NodeLockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            held: AtomicUsize::new(0),
        }
    }

    /// Block until the calling thread holds the lock on `id`
    pub fn lock(&self, id: NodeId) -> Result<()> {
        let entry = self.pin(id);
        let me = thread::current().id();
        let mut state = entry.state.lock();
        if *state == Some(me) {
            drop(state);
            self.unpin(id);
            return Err(TreeError::LockMisuse(format!(
                "node {} is already locked by this thread",
                id
            )));
        }
        while state.is_some() {
            entry.available.wait(&mut state);
        }
        *state = Some(me);
        drop(state);
        self.held.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Release the lock on `id`; the caller must be the holder
    pub fn unlock(&self, id: NodeId) -> Result<()> {
        let entry = match self.entries.get(&id) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                return Err(TreeError::LockMisuse(format!(
                    "unlock of node {} which is not locked",
                    id
                )))
            }
        };
        {
            let mut state = entry.state.lock();
            let me = thread::current().id();
            match *state {
                Some(owner) if owner == me => *state = None,
                Some(_) => {
                    return Err(TreeError::LockMisuse(format!(
                        "node {} unlocked by a thread that does not hold it",
                        id
                    )))
                }
                None => {
                    return Err(TreeError::LockMisuse(format!(
                        "unlock of node {} which is not locked",
                        id
                    )))
                }
            }
            entry.available.notify_one();
        }
        self.held.fetch_sub(1, Ordering::AcqRel);
        self.unpin(id);
        Ok(())
    }

    /// Release every lock held by the calling thread, returning how many
    ///
    /// Recovery path for writers failing mid-operation. Locks held by other
    /// threads are untouched.
    pub fn release_current_thread(&self) -> usize {
        let me = thread::current().id();
        let mine: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|entry| *entry.value().state.lock() == Some(me))
            .map(|entry| *entry.key())
            .collect();
        let mut released = 0;
        for id in mine {
            if self.unlock(id).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// Drop the entry for `id` if it is unpinned
    ///
    /// Cache eviction hook. With pin-counted lifetimes the table usually
    /// cleans itself; this only matters for entries kept alive by races.
    pub fn try_remove(&self, id: NodeId) -> bool {
        self.entries
            .remove_if(&id, |_, entry| entry.pins.load(Ordering::Acquire) == 0)
            .is_some()
    }

    /// Number of locks currently held across all threads
    pub fn count_locked(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Number of live table entries (held or contended locks)
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether `id` is locked by some thread right now
    pub fn is_locked(&self, id: NodeId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.state.lock().is_some(),
            None => false,
        }
    }

    fn pin(&self, id: NodeId) -> Arc<LockEntry> {
        let slot = self
            .entries
            .entry(id)
            .or_insert_with(|| Arc::new(LockEntry::default()));
        slot.pins.fetch_add(1, Ordering::AcqRel);
        Arc::clone(slot.value())
    }

    fn unpin(&self, id: NodeId) {
        let last = match self.entries.get(&id) {
            Some(entry) => entry.pins.fetch_sub(1, Ordering::AcqRel) == 1,
            None => false,
        };
        if last {
            // re-checked under the shard lock; a concurrent pin keeps the entry
            self.entries
                .remove_if(&id, |_, entry| entry.pins.load(Ordering::Acquire) == 0);
        }
    }
}

impl Default for NodeLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lock_unlock_cycle() {
        let registry = NodeLockRegistry::new();
        registry.lock(1).unwrap();
        assert_eq!(registry.count_locked(), 1);
        assert!(registry.is_locked(1));
        registry.unlock(1).unwrap();
        assert_eq!(registry.count_locked(), 0);
        assert!(!registry.is_locked(1));
        // the table cleans up after the last unlock
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn test_independent_nodes() {
        let registry = NodeLockRegistry::new();
        registry.lock(1).unwrap();
        registry.lock(2).unwrap();
        assert_eq!(registry.count_locked(), 2);
        registry.unlock(2).unwrap();
        registry.unlock(1).unwrap();
        assert_eq!(registry.count_locked(), 0);
    }

    #[test]
    fn test_unlock_without_lock() {
        let registry = NodeLockRegistry::new();
        let err = registry.unlock(5).unwrap_err();
        assert!(matches!(err, TreeError::LockMisuse(_)));
    }

    #[test]
    fn test_relock_same_thread_rejected() {
        let registry = NodeLockRegistry::new();
        registry.lock(3).unwrap();
        let err = registry.lock(3).unwrap_err();
        assert!(matches!(err, TreeError::LockMisuse(_)));
        registry.unlock(3).unwrap();
    }

    #[test]
    fn test_unlock_by_other_thread_rejected() {
        let registry = Arc::new(NodeLockRegistry::new());
        registry.lock(7).unwrap();

        let other = registry.clone();
        let handle = thread::spawn(move || other.unlock(7));
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, TreeError::LockMisuse(_)));

        // still held by the original thread
        assert!(registry.is_locked(7));
        registry.unlock(7).unwrap();
    }

    #[test]
    fn test_lock_blocks_until_released() {
        let registry = Arc::new(NodeLockRegistry::new());
        registry.lock(9).unwrap();

        let contender = registry.clone();
        let handle = thread::spawn(move || {
            contender.lock(9).unwrap();
            contender.unlock(9).unwrap();
        });

        // give the contender time to block on the entry
        thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.count_locked(), 1);
        registry.unlock(9).unwrap();
        handle.join().unwrap();
        assert_eq!(registry.count_locked(), 0);
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let registry = Arc::new(NodeLockRegistry::new());
        let counter = Arc::new(Mutex::new(0u64));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        registry.lock(1).unwrap();
                        // non-atomic read-modify-write serialized by the node lock
                        let current = *counter.lock();
                        *counter.lock() = current + 1;
                        registry.unlock(1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 8 * 200);
        assert_eq!(registry.count_locked(), 0);
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn test_release_current_thread_spares_other_holders() {
        let registry = Arc::new(NodeLockRegistry::new());
        registry.lock(1).unwrap();
        registry.lock(2).unwrap();

        let other = registry.clone();
        let released_by_other = thread::spawn(move || {
            other.lock(3).unwrap();
            other.release_current_thread()
        })
        .join()
        .unwrap();
        assert_eq!(released_by_other, 1);

        // this thread's locks survived the other thread's sweep
        assert_eq!(registry.count_locked(), 2);
        assert_eq!(registry.release_current_thread(), 2);
        assert_eq!(registry.count_locked(), 0);
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn test_try_remove_respects_pins() {
        let registry = NodeLockRegistry::new();
        registry.lock(4).unwrap();
        assert!(!registry.try_remove(4));
        assert!(registry.is_locked(4));
        registry.unlock(4).unwrap();
        // already removed by the unlock's unpin
        assert!(!registry.try_remove(4));
        assert_eq!(registry.entry_count(), 0);
    }
}
