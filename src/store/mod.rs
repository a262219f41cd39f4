//! Node storage backends
//!
//! Everything above this layer speaks [`NodeStore`]: get a node image by id,
//! write one back, take and release per-node locks, allocate fresh ids. Two
//! implementations are provided:
//!
//! - [`MemoryNodeStore`]: a concurrent map of node records, no persistence
//! - [`DiskNodeStore`]: a write-back LRU cache over slotted node files plus
//!   a checksummed metadata document for reopening
//!
//! Node ids come from a monotonically increasing counter and are never
//! recycled; a deleted id simply stops resolving.

use crate::node::{Node, NodeContext, NodeId};
use crate::Result;
use std::sync::Arc;

mod cache;
mod disk;
mod file;
mod locks;
mod memory;
mod meta;

pub use cache::{CacheBacking, CacheStats, NodeCache};
pub use disk::DiskNodeStore;
pub use file::{NodeFileStorage, SlottedNodeFile, SplitNodeFile};
pub use locks::NodeLockRegistry;
pub use memory::MemoryNodeStore;
pub use meta::{TreeMeta, META_FILE_NAME, META_FORMAT_VERSION};

/// Shared node storage with per-node exclusive locks
///
/// All methods take `&self`; implementations are internally synchronized and
/// shared across writer threads behind an `Arc`. Reads take no lock, so a
/// `get` can observe a node some other thread is rewriting one version
/// earlier. Writers serialize through `get_and_lock`/`unlock`.
pub trait NodeStore<K, V>: Send + Sync {
    /// Codec and layout context all nodes of this store share
    fn context(&self) -> &Arc<NodeContext<K, V>>;

    /// Allocate the next node id
    fn next_id(&self) -> NodeId;

    /// Read the current image of `id` without locking
    fn get(&self, id: NodeId) -> Result<Node<K, V>>;

    /// Lock `id`, then read it; the lock is released again if the read fails
    fn get_and_lock(&self, id: NodeId) -> Result<Node<K, V>>;

    /// Write the node image back under its id
    fn write(&self, node: &Node<K, V>) -> Result<()>;

    /// Release the lock on `id` taken via [`NodeStore::get_and_lock`]
    fn unlock(&self, id: NodeId) -> Result<()>;

    /// Release every node lock held by the calling thread (error recovery)
    fn release_current_thread(&self) -> usize;

    /// Drop the node image; the id is not reused
    ///
    /// Deleting an id that no longer resolves is a no-op.
    fn delete(&self, id: NodeId) -> Result<()>;

    /// Number of node locks currently held (diagnostic)
    fn locked_count(&self) -> usize;

    /// Push dirty state down to the backing medium, if any
    fn flush(&self) -> Result<()>;

    /// Flush and release backing resources
    fn close(&self) -> Result<()>;
}
