//! Tree configuration and construction
//!
//! [`TreeBuilder`] assembles a tree from its parts: branching factor,
//! layout strategy, the key and value codecs, and optionally a storage
//! directory. Without a directory the tree lives on the heap; with one, the
//! node files are created or reopened in place, and reopening checks the
//! stored metadata against the configured codecs before touching any node.

use crate::api::{BLinkTree, FailureDump};
use crate::codec::{ScalarCodec, U64Codec};
use crate::node::{LayoutStrategy, Node, NodeContext, NIL_NODE};
use crate::store::{DiskNodeStore, MemoryNodeStore, NodeStore, TreeMeta};
use crate::tree::RootPointer;
use crate::{Result, TreeError};
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;

/// Default branching factor (entries per node)
pub const DEFAULT_BRANCHING: usize = 64;

/// Default node cache capacity for disk-backed trees
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Where and how a disk-backed tree keeps its nodes
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Directory holding the node files and the metadata document
    pub directory: PathBuf,

    /// Number of node records the write-back cache holds
    pub cache_capacity: usize,
}

impl StorageOptions {
    /// Storage under `directory` with the default cache capacity
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Override the cache capacity
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

/// Step-by-step construction of a [`BLinkTree`]
///
/// ```no_run
/// use blinktree::{BLinkTree, I64Codec, Utf8Codec};
///
/// let tree: BLinkTree<i64, String> = BLinkTree::builder()
///     .with_branching(32)
///     .with_key_codec(I64Codec)
///     .with_value_codec(Utf8Codec::new(64)?)
///     .open()?;
/// # Ok::<(), blinktree::TreeError>(())
/// ```
pub struct TreeBuilder<K, V> {
    branching: usize,
    layout: LayoutStrategy,
    key_codec: Option<Arc<dyn ScalarCodec<K>>>,
    value_codec: Option<Arc<dyn ScalarCodec<V>>>,
    storage: Option<StorageOptions>,
    dump: Option<FailureDump<K, V>>,
}

impl<K, V> TreeBuilder<K, V> {
    pub fn new() -> Self {
        Self {
            branching: DEFAULT_BRANCHING,
            layout: LayoutStrategy::default(),
            key_codec: None,
            value_codec: None,
            storage: None,
            dump: None,
        }
    }

    /// Maximum number of entries per node
    pub fn with_branching(mut self, branching: usize) -> Self {
        self.branching = branching;
        self
    }

    /// Buffer layout strategy for all nodes
    pub fn with_layout(mut self, layout: LayoutStrategy) -> Self {
        self.layout = layout;
        self
    }

    /// Codec ordering and serializing the keys
    pub fn with_key_codec(mut self, codec: impl ScalarCodec<K> + 'static) -> Self {
        self.key_codec = Some(Arc::new(codec));
        self
    }

    /// Codec serializing the values
    pub fn with_value_codec(mut self, codec: impl ScalarCodec<V> + 'static) -> Self {
        self.value_codec = Some(Arc::new(codec));
        self
    }

    /// Store nodes on disk instead of the heap
    pub fn with_storage(mut self, options: StorageOptions) -> Self {
        self.storage = Some(options);
        self
    }

    /// Write a Graphviz dump here when an operation fails on a broken tree
    pub fn with_failure_dump(mut self, path: impl Into<PathBuf>) -> Self
    where
        K: std::fmt::Debug + 'static,
        V: 'static,
    {
        self.dump = Some(FailureDump {
            path: path.into(),
            render: Box::new(|store, root, path| crate::dot::dump_to_path(store, root, path)),
        });
        self
    }
}

impl<K, V> TreeBuilder<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Build the tree, creating or reopening storage as configured
    pub fn open(self) -> Result<BLinkTree<K, V>> {
        let key_codec = self.key_codec.ok_or_else(|| {
            TreeError::InvalidArgument("a key codec is required".to_string())
        })?;
        let value_codec = self.value_codec.ok_or_else(|| {
            TreeError::InvalidArgument("a value codec is required".to_string())
        })?;
        let ctx = Arc::new(NodeContext::from_shared(
            self.layout,
            self.branching,
            key_codec,
            value_codec,
            Arc::new(U64Codec),
        )?);

        let (store, root): (Arc<dyn NodeStore<K, V>>, Arc<RootPointer>) = match self.storage {
            None => {
                let store: Arc<dyn NodeStore<K, V>> =
                    Arc::new(MemoryNodeStore::new(Arc::clone(&ctx)));
                let root = Arc::new(RootPointer::new(NIL_NODE));
                bootstrap_root(store.as_ref(), &root)?;
                (store, root)
            }
            Some(options) if TreeMeta::exists(&options.directory) => {
                let meta = TreeMeta::read_current(&options.directory)?;
                meta.validate_against(ctx.as_ref())?;
                let root = Arc::new(RootPointer::new(meta.root_id));
                let store: Arc<dyn NodeStore<K, V>> = Arc::new(DiskNodeStore::open(
                    Arc::clone(&ctx),
                    &options,
                    Arc::clone(&root),
                    meta.next_id,
                )?);
                debug!(
                    "reopened tree in {} with root {}",
                    options.directory.display(),
                    meta.root_id
                );
                (store, root)
            }
            Some(options) => {
                let root = Arc::new(RootPointer::new(NIL_NODE));
                let store: Arc<dyn NodeStore<K, V>> = Arc::new(DiskNodeStore::open(
                    Arc::clone(&ctx),
                    &options,
                    Arc::clone(&root),
                    NIL_NODE + 1,
                )?);
                bootstrap_root(store.as_ref(), &root)?;
                // give the fresh directory a valid metadata document
                store.flush()?;
                debug!("created tree in {}", options.directory.display());
                (store, root)
            }
        };
        Ok(BLinkTree::from_parts(store, root, self.dump))
    }
}

impl<K, V> Default for TreeBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the initial empty root leaf and publish its id
fn bootstrap_root<K, V>(store: &dyn NodeStore<K, V>, root: &RootPointer) -> Result<()> {
    let root_id = store.next_id();
    let leaf = Node::new_leaf(root_id, Arc::clone(store.context()));
    store.write(&leaf)?;
    if !root.swap_if(NIL_NODE, root_id) {
        return Err(TreeError::Corruption(
            "root pointer was initialized twice".to_string(),
        ));
    }
    Ok(())
}
