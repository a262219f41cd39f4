//! Disk-backed node store
//!
//! Couples a [`NodeCache`] to a slotted node file and keeps the tree's
//! metadata document up to date. Reads come out of the cache, writes stay
//! dirty in the cache until eviction or an explicit flush, and flush/close
//! additionally sync the files and rewrite the metadata so the directory
//! can be reopened.
//!
//! The file layout is picked from the codec widths: values wider than a
//! link id go through [`SplitNodeFile`], everything else fits the plain
//! [`SlottedNodeFile`].

use crate::config::StorageOptions;
use crate::node::{Node, NodeContext, NodeId};
use crate::store::{
    CacheBacking, CacheStats, NodeCache, NodeFileStorage, NodeLockRegistry, NodeStore,
    SlottedNodeFile, SplitNodeFile, TreeMeta,
};
use crate::tree::RootPointer;
use crate::{Result, TreeError};
use log::debug;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// File name of the node file inside the tree directory
pub const NODES_FILE_NAME: &str = "nodes.blink";

/// File name of the value side file, present only for wide values
pub const VALUES_FILE_NAME: &str = "values.blink";

/// Cache backing that spills to the node file and tidies the lock table
struct DiskBacking {
    file: Box<dyn NodeFileStorage>,
    locks: Arc<NodeLockRegistry>,
}

impl CacheBacking for DiskBacking {
    fn load(&self, id: NodeId) -> Result<Vec<u8>> {
        self.file.load(id)
    }

    fn write_back(&self, id: NodeId, record: &[u8]) -> Result<()> {
        self.file.store(id, record)
    }

    fn release_entry(&self, id: NodeId) {
        self.locks.try_remove(id);
    }
}

/// [`NodeStore`] over a tree directory
pub struct DiskNodeStore<K, V> {
    ctx: Arc<NodeContext<K, V>>,
    cache: NodeCache<DiskBacking>,
    locks: Arc<NodeLockRegistry>,
    next: AtomicU64,
    root: Arc<RootPointer>,
    directory: PathBuf,
}

impl<K, V> DiskNodeStore<K, V> {
    /// Open the node files in `options.directory`, creating them if needed
    ///
    /// `root` and `next_id` come from the metadata document on reopen, or
    /// from the fresh-tree bootstrap. The store keeps the root pointer only
    /// to snapshot it back into the metadata on flush.
    pub fn open(
        ctx: Arc<NodeContext<K, V>>,
        options: &StorageOptions,
        root: Arc<RootPointer>,
        next_id: NodeId,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.directory)?;
        let layout = ctx.layout().clone();
        let nodes_path = options.directory.join(NODES_FILE_NAME);
        let file: Box<dyn NodeFileStorage> = if layout.payload_length() > layout.link_length() {
            debug!(
                "opening split node file, {} byte values exceed {} byte links",
                layout.payload_length(),
                layout.link_length()
            );
            Box::new(SplitNodeFile::open(
                &nodes_path,
                &options.directory.join(VALUES_FILE_NAME),
                layout,
            )?)
        } else {
            Box::new(SlottedNodeFile::open(&nodes_path, layout)?)
        };
        let locks = Arc::new(NodeLockRegistry::new());
        let cache = NodeCache::new(
            options.cache_capacity,
            DiskBacking {
                file,
                locks: Arc::clone(&locks),
            },
        )?;
        Ok(Self {
            ctx,
            cache,
            locks,
            next: AtomicU64::new(next_id),
            root,
            directory: options.directory.clone(),
        })
    }

    /// Cache counters for diagnostics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn persist_meta(&self) -> Result<()> {
        let meta = TreeMeta::snapshot(
            self.ctx.as_ref(),
            self.root.current(),
            self.next.load(Ordering::SeqCst),
        )?;
        meta.write_atomic(&self.directory)
    }

    fn flush_all(&self) -> Result<()> {
        self.cache.flush()?;
        self.cache.backing().file.sync()?;
        self.persist_meta()
    }
}

impl<K, V> NodeStore<K, V> for DiskNodeStore<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn context(&self) -> &Arc<NodeContext<K, V>> {
        &self.ctx
    }

    fn next_id(&self) -> NodeId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    fn get(&self, id: NodeId) -> Result<Node<K, V>> {
        let record = self.cache.get(id)?;
        Node::from_record(id, &record, Arc::clone(&self.ctx))
    }

    fn get_and_lock(&self, id: NodeId) -> Result<Node<K, V>> {
        self.locks.lock(id)?;
        match self.get(id) {
            Ok(node) => Ok(node),
            Err(err) => {
                self.locks.unlock(id)?;
                Err(err)
            }
        }
    }

    fn write(&self, node: &Node<K, V>) -> Result<()> {
        if node.id() == crate::node::NIL_NODE {
            return Err(TreeError::InvalidArgument(
                "cannot write a node under the nil id".to_string(),
            ));
        }
        node.validate()?;
        self.cache.put(node.id(), node.to_record())
    }

    fn unlock(&self, id: NodeId) -> Result<()> {
        self.locks.unlock(id)
    }

    fn release_current_thread(&self) -> usize {
        self.locks.release_current_thread()
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.cache.remove(id);
        self.cache.backing().file.delete(id)
    }

    fn locked_count(&self) -> usize {
        self.locks.count_locked()
    }

    fn flush(&self) -> Result<()> {
        self.flush_all()
    }

    fn close(&self) -> Result<()> {
        self.cache.close()?;
        self.cache.backing().file.sync()?;
        self.persist_meta()
    }
}

impl<K, V> Drop for DiskNodeStore<K, V> {
    fn drop(&mut self) {
        if let Err(err) = self.flush_all() {
            log::warn!("flush on drop failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I64Codec, U64Codec, Utf8Codec};
    use crate::node::{LayoutStrategy, NodePayload, NIL_NODE};
    use tempfile::tempdir;

    fn ctx(branching: usize) -> Arc<NodeContext<i64, i64>> {
        Arc::new(
            NodeContext::new(LayoutStrategy::Variable, branching, I64Codec, I64Codec, U64Codec)
                .unwrap(),
        )
    }

    fn options(dir: &std::path::Path, capacity: usize) -> StorageOptions {
        StorageOptions {
            directory: dir.to_path_buf(),
            cache_capacity: capacity,
        }
    }

    fn open(
        ctx: &Arc<NodeContext<i64, i64>>,
        options: &StorageOptions,
        root_id: NodeId,
        next_id: NodeId,
    ) -> DiskNodeStore<i64, i64> {
        DiskNodeStore::open(
            Arc::clone(ctx),
            options,
            Arc::new(RootPointer::new(root_id)),
            next_id,
        )
        .unwrap()
    }

    fn leaf(
        ctx: &Arc<NodeContext<i64, i64>>,
        id: NodeId,
        entries: &[(i64, i64)],
    ) -> Node<i64, i64> {
        let mut node = Node::new_leaf(id, Arc::clone(ctx));
        for (pos, (key, value)) in entries.iter().enumerate() {
            node.insert_at(pos, key, &NodePayload::Value(*value)).unwrap();
        }
        node
    }

    #[test]
    fn test_round_trip_through_tiny_cache() {
        let dir = tempdir().unwrap();
        let ctx = ctx(4);
        let store = open(&ctx, &options(dir.path(), 2), NIL_NODE, 1);

        let nodes: Vec<_> = (0..6)
            .map(|i| {
                let id = store.next_id();
                let node = leaf(&ctx, id, &[(i, i * 10)]);
                store.write(&node).unwrap();
                node
            })
            .collect();

        // capacity 2 forces most of these through eviction and reload
        for node in &nodes {
            assert_eq!(store.get(node.id()).unwrap(), *node);
        }
        let stats = store.cache_stats();
        assert!(stats.misses > 0);
    }

    #[test]
    fn test_flush_then_reopen() {
        let dir = tempdir().unwrap();
        let ctx = ctx(4);
        let opts = options(dir.path(), 8);

        let written = {
            let store = open(&ctx, &opts, NIL_NODE, 1);
            let id = store.next_id();
            let node = leaf(&ctx, id, &[(1, 100), (2, 200)]);
            store.write(&node).unwrap();
            store.root.swap_if(NIL_NODE, id);
            store.close().unwrap();
            node
        };

        let meta = TreeMeta::read_current(dir.path()).unwrap();
        assert_eq!(meta.root_id, written.id());
        assert_eq!(meta.next_id, 2);
        meta.validate_against(ctx.as_ref()).unwrap();

        let store = open(&ctx, &opts, meta.root_id, meta.next_id);
        assert_eq!(store.get(written.id()).unwrap(), written);
        // the allocator continues where the previous run stopped
        assert_eq!(store.next_id(), 2);
    }

    #[test]
    fn test_wide_values_create_side_file() {
        let dir = tempdir().unwrap();
        let ctx: Arc<NodeContext<i64, String>> = Arc::new(
            NodeContext::new(
                LayoutStrategy::Variable,
                4,
                I64Codec,
                Utf8Codec::new(32).unwrap(),
                U64Codec,
            )
            .unwrap(),
        );
        let store = DiskNodeStore::open(
            Arc::clone(&ctx),
            &options(dir.path(), 4),
            Arc::new(RootPointer::new(NIL_NODE)),
            1,
        )
        .unwrap();

        let id = store.next_id();
        let mut node = Node::new_leaf(id, Arc::clone(&ctx));
        node.insert_at(0, &7, &NodePayload::Value("payload".to_string()))
            .unwrap();
        store.write(&node).unwrap();
        store.flush().unwrap();

        assert!(dir.path().join(VALUES_FILE_NAME).exists());
        assert_eq!(store.get(id).unwrap(), node);
    }

    #[test]
    fn test_narrow_values_use_single_file() {
        let dir = tempdir().unwrap();
        let ctx = ctx(4);
        let store = open(&ctx, &options(dir.path(), 4), NIL_NODE, 1);
        let id = store.next_id();
        store.write(&leaf(&ctx, id, &[(1, 1)])).unwrap();
        store.flush().unwrap();

        assert!(dir.path().join(NODES_FILE_NAME).exists());
        assert!(!dir.path().join(VALUES_FILE_NAME).exists());
    }

    #[test]
    fn test_delete_reaches_the_file() {
        let dir = tempdir().unwrap();
        let ctx = ctx(4);
        let store = open(&ctx, &options(dir.path(), 2), NIL_NODE, 1);

        let id = store.next_id();
        store.write(&leaf(&ctx, id, &[(3, 30)])).unwrap();
        store.flush().unwrap();
        store.delete(id).unwrap();

        // gone from the cache and from the slot underneath it
        assert!(matches!(
            store.get(id).unwrap_err(),
            TreeError::UnknownNode(_)
        ));
    }

    #[test]
    fn test_lock_cycle_and_count() {
        let dir = tempdir().unwrap();
        let ctx = ctx(4);
        let store = open(&ctx, &options(dir.path(), 4), NIL_NODE, 1);

        let id = store.next_id();
        store.write(&leaf(&ctx, id, &[(5, 50)])).unwrap();

        let node = store.get_and_lock(id).unwrap();
        assert_eq!(store.locked_count(), 1);
        store.unlock(node.id()).unwrap();
        assert_eq!(store.locked_count(), 0);

        let err = store.get_and_lock(999).unwrap_err();
        assert!(matches!(err, TreeError::UnknownNode(999)));
        assert_eq!(store.locked_count(), 0);
    }
}
