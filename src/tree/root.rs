//! Shared root pointer
//!
//! The root id is the only piece of tree state outside the nodes
//! themselves. Descents read it without holding any node lock, so by the
//! time a thread reaches a leaf the pointer may already name a stale root;
//! that is fine, the link chain keeps every node reachable from any old
//! root. Growth publishes a new root with a compare-and-swap so that two
//! racing splits of the same root install exactly one winner.

use crate::node::NodeId;
use parking_lot::Mutex;

/// Mutable, shared id of the current root node
pub struct RootPointer {
    current: Mutex<NodeId>,
}

impl RootPointer {
    /// Create a pointer to `id`
    pub fn new(id: NodeId) -> Self {
        Self {
            current: Mutex::new(id),
        }
    }

    /// The current root id
    pub fn current(&self) -> NodeId {
        *self.current.lock()
    }

    /// Install `next` if the pointer still reads `expected`
    ///
    /// Returns whether the swap happened.
    pub fn swap_if(&self, expected: NodeId, next: NodeId) -> bool {
        let mut current = self.current.lock();
        if *current == expected {
            *current = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_swap_if_matches() {
        let root = RootPointer::new(1);
        assert!(root.swap_if(1, 5));
        assert_eq!(root.current(), 5);
    }

    #[test]
    fn test_swap_if_stale_expectation() {
        let root = RootPointer::new(1);
        assert!(root.swap_if(1, 5));
        assert!(!root.swap_if(1, 9));
        assert_eq!(root.current(), 5);
    }

    #[test]
    fn test_racing_swaps_install_one_winner() {
        let root = Arc::new(RootPointer::new(1));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                thread::spawn(move || root.swap_if(1, 100 + i))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(root.current() >= 100);
    }
}
