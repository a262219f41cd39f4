//! Descent routing and the move-right protocol
//!
//! Separators in internal nodes are only hints: a concurrent split can move
//! keys to a fresh right sibling after a thread has already routed past the
//! old node, and separators left stale by deletions can under-report a
//! node's range. Both cases are repaired the same way, by following right
//! links until the current node's range covers the key.
//!
//! [`TreeNavigator::route`] implements the per-node routing rule used by
//! unlocked descents. The two `move_right_*` methods implement the locked
//! variant: they take an already locked node, hop right hand over hand
//! (lock the neighbor, then release the node), and return the locked node
//! the key belongs to. Locks are only ever taken rightward, which is what
//! keeps writers deadlock free.

use crate::node::{KeySlot, Node, NodeContext, NodeId};
use crate::store::NodeStore;
use crate::{Result, TreeError};
use std::cmp::Ordering;
use std::sync::Arc;

/// Next step of a descent through one internal node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Descend into this child
    Child(NodeId),
    /// The key is beyond this node's range, continue at the right sibling
    Link(NodeId),
}

/// Stateless routing over a shared node store
pub struct TreeNavigator<K, V> {
    store: Arc<dyn NodeStore<K, V>>,
    ctx: Arc<NodeContext<K, V>>,
}

impl<K, V> TreeNavigator<K, V> {
    pub fn new(store: Arc<dyn NodeStore<K, V>>) -> Self {
        let ctx = Arc::clone(store.context());
        Self { store, ctx }
    }

    /// Decide where a descent leaves an internal node for `key`
    ///
    /// The child at the key's insertion position covers it. Past the last
    /// separator the link is followed if there is one; the rightmost node
    /// of a level has no link and keeps oversized keys in its last child.
    pub fn route(&self, node: &Node<K, V>, key: &K) -> Result<Route> {
        if node.is_leaf() {
            return Err(TreeError::InvalidArgument(format!(
                "cannot route through leaf node {}",
                node.id()
            )));
        }
        match node.locate_key(key)? {
            KeySlot::Present(pos) => Ok(Route::Child(node.child_at(pos)?)),
            KeySlot::Absent(pos) if pos < node.occupancy() => Ok(Route::Child(node.child_at(pos)?)),
            KeySlot::Absent(_) => match node.link()? {
                Some(link) => Ok(Route::Link(link)),
                None if !node.is_empty() => Ok(Route::Child(node.child_at(node.occupancy() - 1)?)),
                None => Err(TreeError::Corruption(format!(
                    "internal node {} has no entries and no link",
                    node.id()
                ))),
            },
        }
    }

    /// From a locked leaf, hop right until the leaf covers `key`
    pub fn move_right_leaf(&self, mut node: Node<K, V>, key: &K) -> Result<Node<K, V>> {
        loop {
            let hop = match self.leaf_hop(&node, key) {
                Ok(Some(link)) => link,
                Ok(None) => return Ok(node),
                Err(err) => {
                    self.store.unlock(node.id())?;
                    return Err(err);
                }
            };
            node = self.lock_neighbor(node, hop)?;
        }
    }

    /// From a locked internal node, hop right until the node covers `key`
    pub fn move_right_internal(&self, mut node: Node<K, V>, key: &K) -> Result<Node<K, V>> {
        loop {
            let hop = match self.route(&node, key) {
                Ok(Route::Child(_)) => return Ok(node),
                Ok(Route::Link(link)) => link,
                Err(err) => {
                    self.store.unlock(node.id())?;
                    return Err(err);
                }
            };
            node = self.lock_neighbor(node, hop)?;
        }
    }

    /// Link to follow from a leaf, or `None` when `key` belongs here
    ///
    /// An empty leaf with a link is skipped outright; keys larger than the
    /// leaf's maximum drift right along the chain even when deletions have
    /// left the parent separator pointing here. Also used by unlocked
    /// readers, which chase the same links without holding anything.
    pub(crate) fn leaf_hop(&self, node: &Node<K, V>, key: &K) -> Result<Option<NodeId>> {
        let link = match node.link()? {
            Some(link) => link,
            None => return Ok(None),
        };
        let past_max = match node.max_key()? {
            Some(max) => self.ctx.compare_keys(key, &max) == Ordering::Greater,
            None => true,
        };
        Ok(past_max.then_some(link))
    }

    /// Lock `hop`, then release `node` (hand over hand, rightward only)
    fn lock_neighbor(&self, node: Node<K, V>, hop: NodeId) -> Result<Node<K, V>> {
        let next = match self.store.get_and_lock(hop) {
            Ok(next) => next,
            Err(err) => {
                self.store.unlock(node.id())?;
                return Err(err);
            }
        };
        self.store.unlock(node.id())?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I64Codec, U64Codec};
    use crate::node::{LayoutStrategy, NodePayload};
    use crate::store::MemoryNodeStore;

    fn setup() -> (Arc<dyn NodeStore<i64, i64>>, TreeNavigator<i64, i64>) {
        let ctx = Arc::new(
            NodeContext::new(LayoutStrategy::Variable, 4, I64Codec, I64Codec, U64Codec).unwrap(),
        );
        let store: Arc<dyn NodeStore<i64, i64>> = Arc::new(MemoryNodeStore::new(ctx));
        let navigator = TreeNavigator::new(Arc::clone(&store));
        (store, navigator)
    }

    fn internal(
        store: &Arc<dyn NodeStore<i64, i64>>,
        id: NodeId,
        entries: &[(i64, NodeId)],
        link: Option<NodeId>,
    ) -> Node<i64, i64> {
        let mut node = Node::new_internal(id, Arc::clone(store.context()));
        for (pos, (key, child)) in entries.iter().enumerate() {
            node.insert_at(pos, key, &NodePayload::Child(*child)).unwrap();
        }
        node.set_link(link).unwrap();
        store.write(&node).unwrap();
        node
    }

    fn leaf(
        store: &Arc<dyn NodeStore<i64, i64>>,
        id: NodeId,
        entries: &[(i64, i64)],
        link: Option<NodeId>,
    ) -> Node<i64, i64> {
        let mut node = Node::new_leaf(id, Arc::clone(store.context()));
        for (pos, (key, value)) in entries.iter().enumerate() {
            node.insert_at(pos, key, &NodePayload::Value(*value)).unwrap();
        }
        node.set_link(link).unwrap();
        store.write(&node).unwrap();
        node
    }

    #[test]
    fn test_route_by_separator() {
        let (store, navigator) = setup();
        let node = internal(&store, 1, &[(10, 2), (20, 3)], None);

        assert_eq!(navigator.route(&node, &5).unwrap(), Route::Child(2));
        assert_eq!(navigator.route(&node, &10).unwrap(), Route::Child(2));
        assert_eq!(navigator.route(&node, &15).unwrap(), Route::Child(3));
        assert_eq!(navigator.route(&node, &20).unwrap(), Route::Child(3));
    }

    #[test]
    fn test_route_past_last_separator() {
        let (store, navigator) = setup();
        let linked = internal(&store, 1, &[(10, 2)], Some(5));
        let rightmost = internal(&store, 6, &[(10, 2), (20, 3)], None);

        assert_eq!(navigator.route(&linked, &99).unwrap(), Route::Link(5));
        // the rightmost node of a level absorbs oversized keys
        assert_eq!(navigator.route(&rightmost, &99).unwrap(), Route::Child(3));
    }

    #[test]
    fn test_route_rejects_leaves_and_dead_ends() {
        let (store, navigator) = setup();
        let leaf = leaf(&store, 1, &[(1, 1)], None);
        assert!(matches!(
            navigator.route(&leaf, &1).unwrap_err(),
            TreeError::InvalidArgument(_)
        ));

        let dead_end = internal(&store, 2, &[], None);
        assert!(matches!(
            navigator.route(&dead_end, &1).unwrap_err(),
            TreeError::Corruption(_)
        ));
    }

    #[test]
    fn test_move_right_leaf_stays_put_when_covered() {
        let (store, navigator) = setup();
        leaf(&store, 1, &[(5, 50), (10, 100)], Some(2));
        leaf(&store, 2, &[(20, 200)], None);

        let start = store.get_and_lock(1).unwrap();
        let end = navigator.move_right_leaf(start, &7).unwrap();
        assert_eq!(end.id(), 1);
        assert_eq!(store.locked_count(), 1);
        store.unlock(1).unwrap();
    }

    #[test]
    fn test_move_right_leaf_chases_the_chain() {
        let (store, navigator) = setup();
        leaf(&store, 1, &[(5, 50), (10, 100)], Some(2));
        leaf(&store, 2, &[(20, 200)], Some(3));
        leaf(&store, 3, &[(30, 300)], None);

        let start = store.get_and_lock(1).unwrap();
        let end = navigator.move_right_leaf(start, &25).unwrap();
        assert_eq!(end.id(), 3);
        // hand over hand: only the final leaf is still locked
        assert_eq!(store.locked_count(), 1);
        store.unlock(3).unwrap();
        assert_eq!(store.locked_count(), 0);
    }

    #[test]
    fn test_move_right_leaf_skips_empty_leaves() {
        let (store, navigator) = setup();
        leaf(&store, 1, &[], Some(2));
        leaf(&store, 2, &[(20, 200)], None);

        let start = store.get_and_lock(1).unwrap();
        let end = navigator.move_right_leaf(start, &1).unwrap();
        assert_eq!(end.id(), 2);
        store.unlock(2).unwrap();
    }

    #[test]
    fn test_move_right_leaf_ends_on_rightmost() {
        let (store, navigator) = setup();
        leaf(&store, 1, &[(5, 50)], Some(2));
        leaf(&store, 2, &[(20, 200)], None);

        let start = store.get_and_lock(1).unwrap();
        let end = navigator.move_right_leaf(start, &999).unwrap();
        assert_eq!(end.id(), 2);
        store.unlock(2).unwrap();
    }

    #[test]
    fn test_move_right_internal_hops_links() {
        let (store, navigator) = setup();
        internal(&store, 1, &[(10, 7)], Some(2));
        internal(&store, 2, &[(20, 8), (30, 9)], None);

        let start = store.get_and_lock(1).unwrap();
        let end = navigator.move_right_internal(start, &25).unwrap();
        assert_eq!(end.id(), 2);
        assert_eq!(store.locked_count(), 1);
        store.unlock(2).unwrap();
    }

    #[test]
    fn test_move_right_unlocks_on_broken_link() {
        let (store, navigator) = setup();
        // link points at an id that was never written
        leaf(&store, 1, &[(5, 50)], Some(40));

        let start = store.get_and_lock(1).unwrap();
        let err = navigator.move_right_leaf(start, &99).unwrap_err();
        assert!(matches!(err, TreeError::UnknownNode(40)));
        assert_eq!(store.locked_count(), 0);
    }
}
