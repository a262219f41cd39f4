//! Node model: ids, kinds, layout and the shared codec context
//!
//! A tree is a graph of numbered nodes. Each node owns one byte buffer whose
//! shape is dictated by a [`NodeLayout`]; the codecs that read and write the
//! buffer travel together in a [`NodeContext`] shared by every node of a tree.
//!
//! ## Buffer shape
//! ```text
//! [flag: 1][payload(0), key(0)][payload(1), key(1)]...[link: link_len]
//! ```
//! The flag byte distinguishes leaves (`0x01`) from internal nodes (`0x02`).
//! Payloads precede their keys; `payload(i)` belongs to keys `<= key(i)`, and
//! the trailing link names the right sibling (nil when absent).

pub mod layout;
pub mod node;

pub use layout::{
    build_layout, FixedLayout, LayoutStrategy, NodeLayout, VariableLayout, MAX_BRANCHING,
    MIN_BRANCHING,
};
pub use node::{KeySlot, Node, NodePayload};

use crate::codec::ScalarCodec;
use crate::{Result, TreeError};
use std::cmp::Ordering;
use std::sync::Arc;

/// Identifier of a node within one tree
pub type NodeId = u64;

/// Reserved id meaning "no node"; never allocated
pub const NIL_NODE: NodeId = 0;

/// Flag byte marking a leaf node
pub const FLAG_LEAF: u8 = 0x01;

/// Flag byte marking an internal node
pub const FLAG_INTERNAL: u8 = 0x02;

/// Kind of a node, encoded in the buffer's flag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Bottom level: payloads are values
    Leaf,
    /// Upper levels: payloads are child node ids
    Internal,
}

impl NodeKind {
    /// Flag byte for this kind
    pub fn flag(&self) -> u8 {
        match self {
            NodeKind::Leaf => FLAG_LEAF,
            NodeKind::Internal => FLAG_INTERNAL,
        }
    }

    /// Parse a flag byte
    pub fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            FLAG_LEAF => Ok(NodeKind::Leaf),
            FLAG_INTERNAL => Ok(NodeKind::Internal),
            other => Err(TreeError::Corruption(format!(
                "invalid node flag byte 0x{:02x}",
                other
            ))),
        }
    }
}

/// Layout and codecs shared by every node of one tree
///
/// The payload slot serves both node kinds, so its width is the maximum of
/// the value and link codec widths.
pub struct NodeContext<K, V> {
    layout: Arc<dyn NodeLayout>,
    key_codec: Arc<dyn ScalarCodec<K>>,
    value_codec: Arc<dyn ScalarCodec<V>>,
    link_codec: Arc<dyn ScalarCodec<NodeId>>,
}

impl<K, V> NodeContext<K, V> {
    /// Build a context from a layout strategy, branching factor and codecs
    pub fn new(
        strategy: LayoutStrategy,
        branching: usize,
        key_codec: impl ScalarCodec<K> + 'static,
        value_codec: impl ScalarCodec<V> + 'static,
        link_codec: impl ScalarCodec<NodeId> + 'static,
    ) -> Result<Self> {
        Self::from_shared(
            strategy,
            branching,
            Arc::new(key_codec),
            Arc::new(value_codec),
            Arc::new(link_codec),
        )
    }

    /// Build a context from already shared codecs
    pub fn from_shared(
        strategy: LayoutStrategy,
        branching: usize,
        key_codec: Arc<dyn ScalarCodec<K>>,
        value_codec: Arc<dyn ScalarCodec<V>>,
        link_codec: Arc<dyn ScalarCodec<NodeId>>,
    ) -> Result<Self> {
        let payload_len = value_codec.max_length().max(link_codec.max_length());
        let layout = build_layout(
            strategy,
            branching,
            key_codec.max_length(),
            payload_len,
            link_codec.max_length(),
        )?;
        Ok(Self {
            layout,
            key_codec,
            value_codec,
            link_codec,
        })
    }

    /// Buffer layout of this tree's nodes
    pub fn layout(&self) -> &Arc<dyn NodeLayout> {
        &self.layout
    }

    /// Maximum number of entries per node
    pub fn branching(&self) -> usize {
        self.layout.branching()
    }

    /// Key codec
    pub fn key_codec(&self) -> &Arc<dyn ScalarCodec<K>> {
        &self.key_codec
    }

    /// Value codec
    pub fn value_codec(&self) -> &Arc<dyn ScalarCodec<V>> {
        &self.value_codec
    }

    /// Child link codec
    pub fn link_codec(&self) -> &Arc<dyn ScalarCodec<NodeId>> {
        &self.link_codec
    }

    /// Order two keys with the key codec
    pub fn compare_keys(&self, a: &K, b: &K) -> Ordering {
        self.key_codec.compare(a, b)
    }
}

impl<K, V> std::fmt::Debug for NodeContext<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("strategy", &self.layout.strategy())
            .field("branching", &self.layout.branching())
            .field("key", &self.key_codec.descriptor())
            .field("value", &self.value_codec.descriptor())
            .field("link", &self.link_codec.descriptor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I64Codec, U64Codec};

    #[test]
    fn test_kind_flag_round_trip() {
        assert_eq!(NodeKind::from_flag(FLAG_LEAF).unwrap(), NodeKind::Leaf);
        assert_eq!(
            NodeKind::from_flag(FLAG_INTERNAL).unwrap(),
            NodeKind::Internal
        );
        assert!(matches!(
            NodeKind::from_flag(0x00),
            Err(TreeError::Corruption(_))
        ));
        assert!(NodeKind::from_flag(0x03).is_err());
    }

    #[test]
    fn test_context_payload_width_is_max() {
        // value (8) and link (8): payload slot is 8
        let ctx: NodeContext<i64, i64> = NodeContext::new(
            LayoutStrategy::Variable,
            4,
            I64Codec,
            I64Codec,
            U64Codec,
        )
        .unwrap();
        assert_eq!(ctx.layout().payload_length(), 8);

        // wide value (33) beats the link width
        let wide: NodeContext<i64, String> = NodeContext::new(
            LayoutStrategy::Variable,
            4,
            I64Codec,
            crate::codec::Utf8Codec::new(32).unwrap(),
            U64Codec,
        )
        .unwrap();
        assert_eq!(wide.layout().payload_length(), 33);
    }

    #[test]
    fn test_context_rejects_bad_branching() {
        let out_of_range: crate::Result<NodeContext<i64, i64>> = NodeContext::new(
            LayoutStrategy::Fixed,
            1,
            I64Codec,
            I64Codec,
            U64Codec,
        );
        assert!(matches!(
            out_of_range,
            Err(TreeError::InvalidArgument(_))
        ));
    }
}
