//! Concurrent ordered key-value index backed by a B-link tree
//!
//! Keys and values are fixed-width encoded through [`ScalarCodec`]s, nodes
//! hold up to a configured number of entries, and every node carries a link
//! to its right sibling. Readers descend without locks and follow links to
//! recover from concurrent splits; writers hold at most a couple of locks
//! and move rightward or upward only, so operations cannot deadlock.
//!
//! ## Architecture
//! - codec layer: order-preserving fixed-width key and value encodings
//! - node layer: record format and layout strategies over raw buffers
//! - store layer: in-memory table, or disk files behind a write-back LRU cache
//! - tree layer: search, insert with split propagation, delete, traversal
//!
//! ## Quick start
//! ```
//! use blinktree::{BLinkTree, I64Codec};
//!
//! let tree: BLinkTree<i64, i64> = BLinkTree::builder()
//!     .with_key_codec(I64Codec)
//!     .with_value_codec(I64Codec)
//!     .open()?;
//! tree.insert(1, 10)?;
//! assert_eq!(tree.get(&1)?, Some(10));
//! # Ok::<(), blinktree::TreeError>(())
//! ```

pub mod codec;
pub mod config;
pub mod dot;
pub mod node;
pub mod store;
pub mod tree;

mod api;
mod error;

pub use api::{BLinkTree, TreeIter, TreeStats};
pub use codec::{CodecDescriptor, I32Codec, I64Codec, ScalarCodec, U64Codec, Utf8Codec};
pub use config::{StorageOptions, TreeBuilder, DEFAULT_BRANCHING, DEFAULT_CACHE_CAPACITY};
pub use error::{Result, TreeError};
pub use node::{LayoutStrategy, NodeId, NIL_NODE};
