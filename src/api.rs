//! Tree facade
//!
//! [`BLinkTree`] is the handle applications hold: a thread-safe ordered map
//! over the configured store. All methods take `&self` and the handle can be
//! shared across threads behind an `Arc` without further locking.

use crate::config::TreeBuilder;
use crate::node::{Node, NodeContext, NodeId};
use crate::store::NodeStore;
use crate::tree::{LeafVisit, RootPointer, TreeAlgorithm};
use crate::{Result, TreeError};
use log::warn;
use rayon::prelude::*;
use std::fmt::Debug;
use std::io::Write;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Renders a tree into a file, boxed so only trees whose keys are `Debug`
/// pay the bound
pub(crate) type DumpFn<K, V> =
    Box<dyn Fn(&dyn NodeStore<K, V>, NodeId, &Path) -> Result<()> + Send + Sync>;

/// Failure dump configuration carried over from the builder
pub(crate) struct FailureDump<K, V> {
    pub(crate) path: PathBuf,
    pub(crate) render: DumpFn<K, V>,
}

/// Shape counters for one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from the root down to the leaves
    pub depth: usize,
    /// All reachable nodes
    pub node_count: usize,
    /// Reachable internal nodes
    pub internal_count: usize,
    /// Reachable leaves
    pub leaf_count: usize,
    /// Entries stored across all leaves
    pub entry_count: usize,
}

/// Concurrent ordered key-value index
pub struct BLinkTree<K, V> {
    algorithm: TreeAlgorithm<K, V>,
    dump: Option<FailureDump<K, V>>,
}

impl<K, V> BLinkTree<K, V> {
    /// Start configuring a new tree
    pub fn builder() -> TreeBuilder<K, V> {
        TreeBuilder::new()
    }

    pub(crate) fn from_parts(
        store: Arc<dyn NodeStore<K, V>>,
        root: Arc<RootPointer>,
        dump: Option<FailureDump<K, V>>,
    ) -> Self {
        Self {
            algorithm: TreeAlgorithm::new(store, root),
            dump,
        }
    }

    /// Insert or overwrite `key`, returning the previous value if any
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        let result = self.algorithm.insert(&key, value);
        self.checked(result)
    }

    /// Look up the value stored under `key`
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let result = self.algorithm.search(key);
        self.checked(result)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove `key`, returning the value it held
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let result = self.algorithm.remove(key);
        self.checked(result)
    }

    /// Number of stored entries, counted by walking the leaf chain
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for leaf in self.algorithm.visit_leaves()? {
            count += leaf?.occupancy();
        }
        Ok(count)
    }

    /// Whether the tree holds no entries
    pub fn is_empty(&self) -> Result<bool> {
        for leaf in self.algorithm.visit_leaves()? {
            if leaf?.occupancy() > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// All entries in key order
    ///
    /// The iterator walks the leaf chain without taking locks. Entries
    /// written while it runs may or may not appear; entries present for the
    /// whole run do.
    pub fn iter(&self) -> Result<TreeIter<'_, K, V>> {
        Ok(TreeIter {
            ctx: Arc::clone(self.algorithm.context()),
            leaves: self.algorithm.visit_leaves()?,
            current: None,
            index: 0,
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            done: false,
        })
    }

    /// Entries within `range`, in key order
    pub fn range<R>(&self, range: R) -> Result<TreeIter<'_, K, V>>
    where
        R: RangeBounds<K>,
        K: Clone,
    {
        let start = range.start_bound().cloned();
        let end = range.end_bound().cloned();
        let leaves = match &start {
            Bound::Unbounded => self.algorithm.visit_leaves()?,
            Bound::Included(key) | Bound::Excluded(key) => {
                let first = self.algorithm.leaf_for(key)?;
                LeafVisit::new(self.algorithm.store().as_ref(), Some(first))
            }
        };
        Ok(TreeIter {
            ctx: Arc::clone(self.algorithm.context()),
            leaves,
            current: None,
            index: 0,
            start,
            end,
            done: false,
        })
    }

    /// Counters describing the current tree shape
    pub fn stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            depth: self.algorithm.depth()?,
            node_count: 0,
            internal_count: 0,
            leaf_count: 0,
            entry_count: 0,
        };
        for node in self.algorithm.visit_nodes() {
            let node = node?;
            stats.node_count += 1;
            if node.is_leaf() {
                stats.leaf_count += 1;
                stats.entry_count += node.occupancy();
            } else {
                stats.internal_count += 1;
            }
        }
        Ok(stats)
    }

    /// Number of node locks currently held, zero on a quiescent tree
    pub fn locked_count(&self) -> usize {
        self.algorithm.store().locked_count()
    }

    /// Push dirty nodes and metadata to the backing storage
    pub fn flush(&self) -> Result<()> {
        self.algorithm.store().flush()
    }

    /// Flush and release the backing storage
    pub fn close(&self) -> Result<()> {
        self.algorithm.store().close()
    }

    /// Render the current tree as a Graphviz digraph
    pub fn dump_dot<W: Write>(&self, out: &mut W) -> Result<()>
    where
        K: Debug,
    {
        crate::dot::render(
            self.algorithm.store().as_ref(),
            self.algorithm.root_id(),
            out,
        )
    }

    /// On structural failures, write the configured dump before reporting
    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if matches!(err, TreeError::Corruption(_) | TreeError::UnknownNode(_)) {
                self.dump_failure(err);
            }
        }
        result
    }

    fn dump_failure(&self, err: &TreeError) {
        let Some(dump) = &self.dump else { return };
        warn!("writing tree dump to {} after: {}", dump.path.display(), err);
        if let Err(dump_err) = (dump.render)(
            self.algorithm.store().as_ref(),
            self.algorithm.root_id(),
            &dump.path,
        ) {
            warn!("tree dump failed: {}", dump_err);
        }
    }
}

impl<K, V> BLinkTree<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// Insert many entries from a thread pool, returning how many were new
    ///
    /// Entries are distributed over rayon workers. Each insert follows the
    /// usual locking protocol, so the batch is safe to run alongside other
    /// readers and writers.
    pub fn batch_insert(&self, entries: Vec<(K, V)>) -> Result<usize> {
        entries
            .into_par_iter()
            .map(|(key, value)| {
                self.insert(key, value)
                    .map(|previous| usize::from(previous.is_none()))
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }
}

/// Iterator over entries in key order; see [`BLinkTree::iter`]
pub struct TreeIter<'a, K, V> {
    ctx: Arc<NodeContext<K, V>>,
    leaves: LeafVisit<'a, K, V>,
    current: Option<Node<K, V>>,
    index: usize,
    start: Bound<K>,
    end: Bound<K>,
    done: bool,
}

enum Step<K, V> {
    Yield(K, V),
    Skip,
    Finished,
}

impl<'a, K, V> TreeIter<'a, K, V> {
    fn classify(&self, leaf: &Node<K, V>, index: usize) -> Result<Step<K, V>> {
        let key = leaf.key_at(index)?;
        if self.below_start(&key) {
            return Ok(Step::Skip);
        }
        if self.past_end(&key) {
            return Ok(Step::Finished);
        }
        let value = leaf.value_at(index)?;
        Ok(Step::Yield(key, value))
    }

    fn below_start(&self, key: &K) -> bool {
        use std::cmp::Ordering::{Greater, Less};
        match &self.start {
            Bound::Unbounded => false,
            Bound::Included(start) => self.ctx.compare_keys(key, start) == Less,
            Bound::Excluded(start) => self.ctx.compare_keys(key, start) != Greater,
        }
    }

    fn past_end(&self, key: &K) -> bool {
        use std::cmp::Ordering::{Greater, Less};
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => self.ctx.compare_keys(key, end) == Greater,
            Bound::Excluded(end) => self.ctx.compare_keys(key, end) != Less,
        }
    }
}

impl<'a, K, V> Iterator for TreeIter<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let leaf = match self.current.take() {
                Some(leaf) => leaf,
                None => match self.leaves.next() {
                    None => return None,
                    Some(Ok(leaf)) => {
                        self.index = 0;
                        leaf
                    }
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                },
            };
            while self.index < leaf.occupancy() {
                let index = self.index;
                self.index += 1;
                match self.classify(&leaf, index) {
                    Ok(Step::Yield(key, value)) => {
                        self.current = Some(leaf);
                        return Some(Ok((key, value)));
                    }
                    Ok(Step::Skip) => {}
                    Ok(Step::Finished) => {
                        self.done = true;
                        return None;
                    }
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I64Codec, Utf8Codec};
    use crate::config::StorageOptions;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn memory_tree(branching: usize) -> BLinkTree<i64, i64> {
        BLinkTree::builder()
            .with_branching(branching)
            .with_key_codec(I64Codec)
            .with_value_codec(I64Codec)
            .open()
            .unwrap()
    }

    #[test]
    fn test_map_basics() {
        let tree = memory_tree(4);
        assert!(tree.is_empty().unwrap());
        assert!(!tree.contains_key(&7).unwrap());

        assert_eq!(tree.insert(7, 70).unwrap(), None);
        assert_eq!(tree.insert(7, 77).unwrap(), Some(70));
        assert!(tree.contains_key(&7).unwrap());
        assert_eq!(tree.len().unwrap(), 1);

        assert_eq!(tree.remove(&7).unwrap(), Some(77));
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.locked_count(), 0);
    }

    #[test]
    fn test_iter_in_key_order() {
        let tree = memory_tree(3);
        for key in [5, 1, 9, 3, 7, 2, 8, 4, 6] {
            tree.insert(key, key * 10).unwrap();
        }

        let listed: Vec<(i64, i64)> = tree.iter().unwrap().map(|entry| entry.unwrap()).collect();
        let expected: Vec<(i64, i64)> = (1..=9).map(|key| (key, key * 10)).collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_iter_empty_tree() {
        let tree = memory_tree(4);
        assert_eq!(tree.iter().unwrap().count(), 0);
    }

    #[test]
    fn test_range_bounds_match_btreemap() {
        let tree = memory_tree(3);
        let mut oracle = BTreeMap::new();
        for key in 0..100 {
            tree.insert(key, key).unwrap();
            oracle.insert(key, key);
        }

        let cases: Vec<(Bound<i64>, Bound<i64>)> = vec![
            (Bound::Unbounded, Bound::Unbounded),
            (Bound::Included(25), Bound::Unbounded),
            (Bound::Excluded(25), Bound::Unbounded),
            (Bound::Unbounded, Bound::Included(75)),
            (Bound::Unbounded, Bound::Excluded(75)),
            (Bound::Included(25), Bound::Excluded(75)),
            (Bound::Excluded(25), Bound::Included(75)),
            (Bound::Included(40), Bound::Included(40)),
            (Bound::Included(200), Bound::Unbounded),
        ];
        for (start, end) in cases {
            let listed: Vec<i64> = tree
                .range((start, end))
                .unwrap()
                .map(|entry| entry.unwrap().0)
                .collect();
            let expected: Vec<i64> = oracle.range((start, end)).map(|(key, _)| *key).collect();
            assert_eq!(listed, expected, "range {:?}..{:?}", start, end);
        }
    }

    #[test]
    fn test_range_shorthand() {
        let tree = memory_tree(4);
        for key in 0..20 {
            tree.insert(key, key).unwrap();
        }
        let listed: Vec<i64> = tree
            .range(5..10)
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(listed, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_string_keys() {
        let tree: BLinkTree<String, i64> = BLinkTree::builder()
            .with_branching(4)
            .with_key_codec(Utf8Codec::new(32).unwrap())
            .with_value_codec(I64Codec)
            .open()
            .unwrap();

        for (word, n) in [("pear", 1), ("apple", 2), ("fig", 3), ("banana", 4)] {
            tree.insert(word.to_string(), n).unwrap();
        }
        assert_eq!(tree.get(&"fig".to_string()).unwrap(), Some(3));

        let words: Vec<String> = tree.iter().unwrap().map(|entry| entry.unwrap().0).collect();
        assert_eq!(words, vec!["apple", "banana", "fig", "pear"]);
    }

    #[test]
    fn test_batch_insert_parallel() {
        let tree = memory_tree(8);
        tree.insert(5, 5).unwrap();

        let entries: Vec<(i64, i64)> = (0..1000).map(|key| (key, key * 2)).collect();
        let fresh = tree.batch_insert(entries).unwrap();

        // key 5 already existed
        assert_eq!(fresh, 999);
        assert_eq!(tree.len().unwrap(), 1000);
        assert_eq!(tree.locked_count(), 0);
        for key in 0..1000 {
            assert_eq!(tree.get(&key).unwrap(), Some(key * 2));
        }
    }

    #[test]
    fn test_stats_counts() {
        let tree = memory_tree(2);
        for key in 1..=10 {
            tree.insert(key, key).unwrap();
        }
        let stats = tree.stats().unwrap();
        assert_eq!(stats.entry_count, 10);
        assert!(stats.depth > 1);
        assert!(stats.leaf_count > 1);
        assert_eq!(stats.node_count, stats.leaf_count + stats.internal_count);
    }

    #[test]
    fn test_dump_dot_output() {
        let tree = memory_tree(2);
        for key in 1..=5 {
            tree.insert(key, key).unwrap();
        }
        let mut out = Vec::new();
        tree.dump_dot(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("digraph"));
        assert!(text.contains("style=dashed"));
    }

    #[test]
    fn test_failure_dump_written_on_broken_tree() {
        let dir = tempdir().unwrap();
        let dump_path = dir.path().join("broken.dot");
        let tree: BLinkTree<i64, i64> = BLinkTree::builder()
            .with_branching(2)
            .with_key_codec(I64Codec)
            .with_value_codec(I64Codec)
            .with_failure_dump(&dump_path)
            .open()
            .unwrap();
        for key in 1..=10 {
            tree.insert(key, key).unwrap();
        }

        // knock out the leaf holding key 1, then trip over it
        let victim = tree.algorithm.leaf_for(&1).unwrap();
        tree.algorithm.store().delete(victim).unwrap();
        assert!(tree.get(&1).is_err());
        assert!(dump_path.exists());
    }

    #[test]
    fn test_disk_tree_full_surface() {
        let dir = tempdir().unwrap();
        let tree: BLinkTree<i64, i64> = BLinkTree::builder()
            .with_branching(4)
            .with_key_codec(I64Codec)
            .with_value_codec(I64Codec)
            .with_storage(StorageOptions::new(dir.path()).with_cache_capacity(4))
            .open()
            .unwrap();

        for key in 0..100 {
            tree.insert(key, key + 1).unwrap();
        }
        let listed: Vec<i64> = tree.iter().unwrap().map(|entry| entry.unwrap().0).collect();
        assert_eq!(listed, (0..100).collect::<Vec<_>>());

        tree.flush().unwrap();
        assert_eq!(tree.len().unwrap(), 100);
        tree.close().unwrap();
    }
}
