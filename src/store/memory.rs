//! In-memory node store
//!
//! Node records live in a concurrent hash map; ids come from an atomic
//! counter starting at 1 so that 0 stays free as the nil sentinel. This is
//! the default backend and the reference behavior the disk store has to
//! match: unlocked readers see whole records, never partial writes, because
//! `get` clones the record under the map shard lock.

use crate::node::{Node, NodeContext, NodeId, NIL_NODE};
use crate::store::{NodeLockRegistry, NodeStore};
use crate::{Result, TreeError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Heap-backed [`NodeStore`] keyed by node id
pub struct MemoryNodeStore<K, V> {
    ctx: Arc<NodeContext<K, V>>,
    slots: DashMap<NodeId, Vec<u8>>,
    locks: NodeLockRegistry,
    next: AtomicU64,
}

impl<K, V> MemoryNodeStore<K, V> {
    /// Create an empty store for nodes of the given context
    pub fn new(ctx: Arc<NodeContext<K, V>>) -> Self {
        Self {
            ctx,
            slots: DashMap::new(),
            locks: NodeLockRegistry::new(),
            next: AtomicU64::new(NIL_NODE + 1),
        }
    }

    /// Number of stored nodes
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no nodes
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K, V> NodeStore<K, V> for MemoryNodeStore<K, V>
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
        let record = self
            .slots
            .get(&id)
            .map(|slot| slot.value().clone())
            .ok_or(TreeError::UnknownNode(id))?;
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
        if node.id() == NIL_NODE {
            return Err(TreeError::InvalidArgument(
                "cannot write a node under the nil id".to_string(),
            ));
        }
        node.validate()?;
        self.slots.insert(node.id(), node.to_record());
        Ok(())
    }

    fn unlock(&self, id: NodeId) -> Result<()> {
        self.locks.unlock(id)
    }

    fn release_current_thread(&self) -> usize {
        self.locks.release_current_thread()
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.slots.remove(&id);
        Ok(())
    }

    fn locked_count(&self) -> usize {
        self.locks.count_locked()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I64Codec, U64Codec};
    use crate::node::{LayoutStrategy, NodePayload};

    fn store() -> MemoryNodeStore<i64, i64> {
        let ctx = NodeContext::new(LayoutStrategy::Variable, 8, I64Codec, I64Codec, U64Codec)
            .unwrap();
        MemoryNodeStore::new(Arc::new(ctx))
    }

    #[test]
    fn test_ids_start_after_nil() {
        let store = store();
        assert_eq!(store.next_id(), 1);
        assert_eq!(store.next_id(), 2);
    }

    #[test]
    fn test_write_get_round_trip() {
        let store = store();
        let id = store.next_id();
        let mut node = Node::new_leaf(id, Arc::clone(store.context()));
        node.insert_at(0, &42, &NodePayload::Value(7)).unwrap();
        store.write(&node).unwrap();

        let loaded = store.get(id).unwrap();
        assert_eq!(loaded, node);
        assert_eq!(loaded.value_at(0).unwrap(), 7);
    }

    #[test]
    fn test_get_unknown_node() {
        let store = store();
        let err = store.get(99).unwrap_err();
        assert!(matches!(err, TreeError::UnknownNode(99)));
    }

    #[test]
    fn test_write_rejects_nil_id() {
        let store = store();
        let node: Node<i64, i64> = Node::new_leaf(NIL_NODE, Arc::clone(store.context()));
        let err = store.write(&node).unwrap_err();
        assert!(matches!(err, TreeError::InvalidArgument(_)));
    }

    #[test]
    fn test_overwrite_replaces_record() {
        let store = store();
        let id = store.next_id();
        let mut node = Node::new_leaf(id, Arc::clone(store.context()));
        node.insert_at(0, &1, &NodePayload::Value(10)).unwrap();
        store.write(&node).unwrap();

        node.set_payload_at(0, &NodePayload::Value(20)).unwrap();
        store.write(&node).unwrap();
        assert_eq!(store.get(id).unwrap().value_at(0).unwrap(), 20);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_and_lock_releases_on_failure() {
        let store = store();
        let err = store.get_and_lock(50).unwrap_err();
        assert!(matches!(err, TreeError::UnknownNode(50)));
        assert_eq!(store.locked_count(), 0);
    }

    #[test]
    fn test_get_and_lock_holds_until_unlock() {
        let store = store();
        let id = store.next_id();
        store
            .write(&Node::new_leaf(id, Arc::clone(store.context())))
            .unwrap();

        let node = store.get_and_lock(id).unwrap();
        assert_eq!(store.locked_count(), 1);
        store.unlock(node.id()).unwrap();
        assert_eq!(store.locked_count(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = store();
        let id = store.next_id();
        store
            .write(&Node::new_leaf(id, Arc::clone(store.context())))
            .unwrap();
        store.delete(id).unwrap();
        assert!(matches!(
            store.get(id).unwrap_err(),
            TreeError::UnknownNode(_)
        ));
        // a second delete of the same id is fine
        store.delete(id).unwrap();
        assert!(store.is_empty());
    }
}
