//! Tree traversal iterators
//!
//! Read-only walks used by iteration, statistics and rendering. Neither
//! iterator takes locks; under concurrent writers they see some consistent
//! recent shape of each node but not necessarily one point-in-time tree.

use crate::node::{Node, NodeId};
use crate::store::NodeStore;
use crate::Result;
use std::collections::HashSet;

/// Every node reachable from a starting node, parents before children
///
/// Both child and link edges are followed and each node is reported once,
/// so right siblings whose separators have not been posted yet still show
/// up.
pub struct NodeVisit<'a, K, V> {
    store: &'a dyn NodeStore<K, V>,
    pending: Vec<NodeId>,
    seen: HashSet<NodeId>,
}

impl<'a, K, V> NodeVisit<'a, K, V> {
    pub fn new(store: &'a dyn NodeStore<K, V>, start: NodeId) -> Self {
        let mut seen = HashSet::new();
        seen.insert(start);
        Self {
            store,
            pending: vec![start],
            seen,
        }
    }

    fn enqueue(&mut self, id: NodeId) {
        if self.seen.insert(id) {
            self.pending.push(id);
        }
    }

    fn expand(&mut self, node: &Node<K, V>) -> Result<()> {
        if let Some(link) = node.link()? {
            self.enqueue(link);
        }
        if node.is_internal() {
            for index in (0..node.occupancy()).rev() {
                let child = node.child_at(index)?;
                self.enqueue(child);
            }
        }
        Ok(())
    }
}

impl<'a, K, V> Iterator for NodeVisit<'a, K, V> {
    type Item = Result<Node<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.pending.pop()?;
        let node = match self.store.get(id) {
            Ok(node) => node,
            Err(err) => {
                self.pending.clear();
                return Some(Err(err));
            }
        };
        if let Err(err) = self.expand(&node) {
            self.pending.clear();
            return Some(Err(err));
        }
        Some(Ok(node))
    }
}

/// The leaf chain from a starting leaf, in key order
pub struct LeafVisit<'a, K, V> {
    store: &'a dyn NodeStore<K, V>,
    next: Option<NodeId>,
}

impl<'a, K, V> LeafVisit<'a, K, V> {
    pub fn new(store: &'a dyn NodeStore<K, V>, first: Option<NodeId>) -> Self {
        Self { store, next: first }
    }
}

impl<'a, K, V> Iterator for LeafVisit<'a, K, V> {
    type Item = Result<Node<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        let node = match self.store.get(id) {
            Ok(node) => node,
            Err(err) => return Some(Err(err)),
        };
        match node.link() {
            Ok(link) => self.next = link,
            Err(err) => return Some(Err(err)),
        }
        Some(Ok(node))
    }
}
