//! Core tree operations
//!
//! Implements the Lehman/Yao discipline over the node store: descents take
//! no locks at all, writers lock exactly one node at a time plus briefly
//! its parent, and every stale turn a thread can take is repaired by
//! following right links. The pieces:
//!
//! - **search**: unlocked descent, then an unlocked link chase at leaf
//!   level. May run concurrently with any number of writers.
//! - **insert**: unlocked descent remembering the child-route ancestors,
//!   then lock the leaf, move right to the covering leaf, and either
//!   overwrite in place or insert. A full leaf is split first; the pending
//!   entry goes into whichever half covers it, so occupancy never exceeds
//!   the branching factor.
//! - **split propagation**: after a split the parent learns about the new
//!   sibling by replacing the old separator with two fresh ones. A full
//!   parent is split the same way first, walking up to the root.
//! - **root growth**: splitting a node with no remembered ancestor builds
//!   a new root over both halves and publishes it with a compare-and-swap.
//! - **remove**: locate and delete the entry, nothing else. Nodes are
//!   never merged and separators are left stale; the routing rules absorb
//!   both.
//!
//! Locks are taken strictly rightward along a level and upward across
//! levels, never downward or leftward, so writers cannot deadlock. A
//! writer that fails mid-operation releases every lock it still holds
//! before the error surfaces.

use crate::node::{KeySlot, Node, NodeContext, NodeId, NodePayload};
use crate::store::NodeStore;
use crate::tree::{LeafVisit, NodeVisit, RootPointer, Route, TreeNavigator};
use crate::{Result, TreeError};
use log::{debug, warn};
use std::cmp::Ordering;
use std::sync::Arc;

/// Concurrent ordered map operations over a node store
pub struct TreeAlgorithm<K, V> {
    store: Arc<dyn NodeStore<K, V>>,
    navigator: TreeNavigator<K, V>,
    root: Arc<RootPointer>,
    ctx: Arc<NodeContext<K, V>>,
}

impl<K, V> TreeAlgorithm<K, V> {
    pub fn new(store: Arc<dyn NodeStore<K, V>>, root: Arc<RootPointer>) -> Self {
        let ctx = Arc::clone(store.context());
        let navigator = TreeNavigator::new(Arc::clone(&store));
        Self {
            store,
            navigator,
            root,
            ctx,
        }
    }

    /// The store this tree lives in
    pub fn store(&self) -> &Arc<dyn NodeStore<K, V>> {
        &self.store
    }

    /// Current root id
    pub fn root_id(&self) -> NodeId {
        self.root.current()
    }

    /// Codec and layout context
    pub fn context(&self) -> &Arc<NodeContext<K, V>> {
        &self.ctx
    }

    /// Look up the value stored under `key` without taking any lock
    pub fn search(&self, key: &K) -> Result<Option<V>> {
        let (leaf_id, _) = self.descend(key)?;
        let mut node = self.store.get(leaf_id)?;
        while let Some(hop) = self.navigator.leaf_hop(&node, key)? {
            node = self.store.get(hop)?;
        }
        match node.locate_key(key)? {
            KeySlot::Present(pos) => Ok(Some(node.value_at(pos)?)),
            KeySlot::Absent(_) => Ok(None),
        }
    }

    /// Insert or overwrite `key`, returning the previous value if any
    pub fn insert(&self, key: &K, value: V) -> Result<Option<V>> {
        self.check_encodable(key, &value)?;
        self.recover_locks(self.insert_entry(key, value))
    }

    fn insert_entry(&self, key: &K, value: V) -> Result<Option<V>> {
        let payload = NodePayload::Value(value);
        let (leaf_id, mut ancestors) = self.descend(key)?;
        let node = self.store.get_and_lock(leaf_id)?;
        let mut node = self.navigator.move_right_leaf(node, key)?;

        match node.locate_key(key)? {
            KeySlot::Present(pos) => {
                let previous = node.value_at(pos)?;
                node.set_payload_at(pos, &payload)?;
                self.store.write(&node)?;
                self.store.unlock(node.id())?;
                Ok(Some(previous))
            }
            KeySlot::Absent(pos) if node.occupancy() < self.ctx.branching() => {
                node.insert_at(pos, key, &payload)?;
                self.store.write(&node)?;
                self.store.unlock(node.id())?;
                Ok(None)
            }
            KeySlot::Absent(_) => {
                self.split_insert(node, key, &payload, &mut ancestors)?;
                Ok(None)
            }
        }
    }

    /// Remove `key`, returning the value it held
    ///
    /// Deletion never rebalances: leaves may become empty and separators go
    /// stale, both of which the routing rules tolerate.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.recover_locks(self.remove_entry(key))
    }

    fn remove_entry(&self, key: &K) -> Result<Option<V>> {
        let (leaf_id, _) = self.descend(key)?;
        let node = self.store.get_and_lock(leaf_id)?;
        let mut node = self.navigator.move_right_leaf(node, key)?;
        let removed = match node.locate_key(key)? {
            KeySlot::Present(pos) => {
                let value = node.value_at(pos)?;
                node.remove_at(pos)?;
                self.store.write(&node)?;
                Some(value)
            }
            KeySlot::Absent(_) => None,
        };
        self.store.unlock(node.id())?;
        Ok(removed)
    }

    /// Every node reachable from the current root
    pub fn visit_nodes(&self) -> NodeVisit<'_, K, V> {
        NodeVisit::new(self.store.as_ref(), self.root.current())
    }

    /// The leaf chain in key order
    pub fn visit_leaves(&self) -> Result<LeafVisit<'_, K, V>> {
        let first = self.leftmost_leaf()?;
        Ok(LeafVisit::new(self.store.as_ref(), Some(first)))
    }

    /// The leaf an unlocked descent for `key` ends at
    pub fn leaf_for(&self, key: &K) -> Result<NodeId> {
        self.descend(key).map(|(leaf_id, _)| leaf_id)
    }

    /// Number of levels from the root down to the leaves
    pub fn depth(&self) -> Result<usize> {
        let mut depth = 1;
        let mut id = self.root.current();
        loop {
            let node = self.store.get(id)?;
            if node.is_leaf() {
                return Ok(depth);
            }
            id = node.child_at(0)?;
            depth += 1;
        }
    }

    /// Unlocked walk from the root to the leaf covering `key`
    ///
    /// Returns the leaf id and the internal nodes entered through child
    /// routes, root first. Link hops are sideways moves, not ancestors, so
    /// they are left out; split propagation walks this stack upward.
    fn descend(&self, key: &K) -> Result<(NodeId, Vec<NodeId>)> {
        let mut ancestors = Vec::new();
        let mut id = self.root.current();
        loop {
            let node = self.store.get(id)?;
            if node.is_leaf() {
                return Ok((id, ancestors));
            }
            match self.navigator.route(&node, key)? {
                Route::Child(child) => {
                    ancestors.push(id);
                    id = child;
                }
                Route::Link(link) => id = link,
            }
        }
    }

    fn leftmost_leaf(&self) -> Result<NodeId> {
        let mut id = self.root.current();
        loop {
            let node = self.store.get(id)?;
            if node.is_leaf() {
                return Ok(id);
            }
            id = node.child_at(0)?;
        }
    }

    /// Split the full, locked leaf and place the pending entry
    fn split_insert(
        &self,
        mut node: Node<K, V>,
        key: &K,
        payload: &NodePayload<V>,
        ancestors: &mut Vec<NodeId>,
    ) -> Result<()> {
        let right_id = self.store.next_id();
        let mut right = Node::new_leaf(right_id, Arc::clone(&self.ctx));
        node.split_top_half_into(&mut right)?;

        let low_max = self.half_max(&node)?;
        let target = if self.ctx.compare_keys(key, &low_max) == Ordering::Greater {
            &mut right
        } else {
            &mut node
        };
        match target.locate_key(key)? {
            KeySlot::Absent(pos) => target.insert_at(pos, key, payload)?,
            KeySlot::Present(_) => {
                return Err(TreeError::Corruption(format!(
                    "key resurfaced in node {} while splitting",
                    target.id()
                )))
            }
        }

        // the right half must be readable before the link to it goes live
        self.store.write(&right)?;
        self.store.write(&node)?;
        debug!(
            "split leaf {} into {} ({} + {} entries)",
            node.id(),
            right.id(),
            node.occupancy(),
            right.occupancy()
        );
        self.propagate(node, right, ancestors)
    }

    /// Post a finished split to the parent level, splitting upward as needed
    ///
    /// `node` is the locked left half, `right` its freshly written sibling.
    /// Each round replaces the parent's old separator for `node` with two
    /// entries, one per half, then releases `node`. The parent takes the
    /// locked role for the next round if it had to split too.
    fn propagate(
        &self,
        mut node: Node<K, V>,
        mut right: Node<K, V>,
        ancestors: &mut Vec<NodeId>,
    ) -> Result<()> {
        loop {
            let low_max = self.half_max(&node)?;
            let high_max = self.half_max(&right)?;

            let parent_id = match ancestors.pop() {
                Some(parent_id) => parent_id,
                None => return self.grow_root(node, &low_max, &high_max, right.id()),
            };
            let parent = self.store.get_and_lock(parent_id)?;
            let mut parent = self.navigator.move_right_internal(parent, &high_max)?;

            let pos = match parent.position_of_child(node.id())? {
                Some(pos) => pos,
                None => {
                    // the split node never had its separator posted (it is
                    // itself an unposted right half); its keys stay reachable
                    // over the link chain, so there is nothing to rewrite
                    warn!(
                        "no separator for split node {} under {}; {} stays link-only",
                        node.id(),
                        parent.id(),
                        right.id()
                    );
                    self.store.unlock(parent.id())?;
                    return self.store.unlock(node.id());
                }
            };

            if parent.occupancy() < self.ctx.branching() {
                self.replace_separator(&mut parent, pos, &low_max, node.id(), &high_max, right.id())?;
                self.store.write(&parent)?;
                self.store.unlock(parent.id())?;
                return self.store.unlock(node.id());
            }

            // full parent: split it first, then rewrite in whichever half
            // kept the old separator
            let parent_right_id = self.store.next_id();
            let mut parent_right = Node::new_internal(parent_right_id, Arc::clone(&self.ctx));
            parent.split_top_half_into(&mut parent_right)?;
            let kept = parent.occupancy();
            if pos < kept {
                self.replace_separator(&mut parent, pos, &low_max, node.id(), &high_max, right.id())?;
            } else {
                self.replace_separator(
                    &mut parent_right,
                    pos - kept,
                    &low_max,
                    node.id(),
                    &high_max,
                    right.id(),
                )?;
            }
            self.store.write(&parent_right)?;
            self.store.write(&parent)?;
            debug!(
                "split internal {} into {} while posting",
                parent.id(),
                parent_right.id()
            );
            self.store.unlock(node.id())?;
            node = parent;
            right = parent_right;
        }
    }

    /// Swap the separator at `pos` for one entry per half
    ///
    /// Both new separators are bounded by the old one, so the surrounding
    /// order is undisturbed even when deletions had left it stale.
    fn replace_separator(
        &self,
        parent: &mut Node<K, V>,
        pos: usize,
        low_max: &K,
        left: NodeId,
        high_max: &K,
        right: NodeId,
    ) -> Result<()> {
        parent.remove_at(pos)?;
        parent.insert_at(pos, low_max, &NodePayload::Child(left))?;
        parent.insert_at(pos + 1, high_max, &NodePayload::Child(right))?;
        Ok(())
    }

    /// Publish a new root above a split that ran out of ancestors
    fn grow_root(&self, node: Node<K, V>, low_max: &K, high_max: &K, right_id: NodeId) -> Result<()> {
        let new_root_id = self.store.next_id();
        let mut new_root = Node::new_internal(new_root_id, Arc::clone(&self.ctx));
        new_root.insert_at(0, low_max, &NodePayload::Child(node.id()))?;
        new_root.insert_at(1, high_max, &NodePayload::Child(right_id))?;
        self.store.write(&new_root)?;

        if self.root.swap_if(node.id(), new_root_id) {
            debug!("root grew from {} to {}", node.id(), new_root_id);
        } else {
            // another thread published a root first; nothing points at this
            // attempt, so drop the node (the id itself is not reused)
            self.store.delete(new_root_id)?;
            warn!("discarded root {} after losing the growth race", new_root_id);
        }
        self.store.unlock(node.id())
    }

    fn half_max(&self, node: &Node<K, V>) -> Result<K> {
        node.max_key()?.ok_or_else(|| {
            TreeError::Corruption(format!("split produced an empty half in node {}", node.id()))
        })
    }

    /// Reject keys and values the codecs cannot encode, before any lock is taken
    fn check_encodable(&self, key: &K, value: &V) -> Result<()> {
        let keys = self.ctx.key_codec();
        let mut slot = vec![0u8; keys.max_length()];
        keys.encode(key, &mut slot, 0)?;

        let values = self.ctx.value_codec();
        let mut slot = vec![0u8; values.max_length()];
        values.encode(value, &mut slot, 0)?;
        Ok(())
    }

    /// Pass `result` through, releasing this thread's node locks on failure
    fn recover_locks<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            let released = self.store.release_current_thread();
            if released > 0 {
                warn!("released {} node locks after a failed operation", released);
            }
        }
        result
    }
}
