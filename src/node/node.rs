//! Node: sorted entries over a raw byte buffer
//!
//! A [`Node`] owns its buffer and edits it through the layout and codecs in
//! the shared [`NodeContext`]. Entries stay sorted by key; a leaf payload is
//! a value, an internal payload is a child id covering all keys up to and
//! including the entry key. The trailing link names the right sibling.
//!
//! A node does not enforce the branching limit on inserts (the tree splits
//! before overflow and stores reject oversized nodes on write); it does
//! guarantee that a failed edit leaves the buffer untouched.

use super::{NodeContext, NodeId, NodeKind, NIL_NODE};
use crate::{Result, TreeError};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Payload of one entry: a value in leaves, a child id in internal nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePayload<V> {
    /// Leaf payload
    Value(V),
    /// Internal payload: id of the subtree holding keys `<=` the entry key
    Child(NodeId),
}

/// Where a key sits (or would sit) in a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// Key found at this entry index
    Present(usize),
    /// Key absent; this is the index it would be inserted at
    Absent(usize),
}

/// One tree node: flag byte, sorted `(payload, key)` pairs, right link
pub struct Node<K, V> {
    id: NodeId,
    kind: NodeKind,
    occupancy: usize,
    buf: Vec<u8>,
    ctx: Arc<NodeContext<K, V>>,
}

impl<K, V> Node<K, V> {
    /// Create an empty leaf
    pub fn new_leaf(id: NodeId, ctx: Arc<NodeContext<K, V>>) -> Self {
        Self::empty(id, NodeKind::Leaf, ctx)
    }

    /// Create an empty internal node
    pub fn new_internal(id: NodeId, ctx: Arc<NodeContext<K, V>>) -> Self {
        Self::empty(id, NodeKind::Internal, ctx)
    }

    fn empty(id: NodeId, kind: NodeKind, ctx: Arc<NodeContext<K, V>>) -> Self {
        let mut buf = vec![0u8; ctx.layout().buffer_length(0)];
        buf[0] = kind.flag();
        Self {
            id,
            kind,
            occupancy: 0,
            buf,
            ctx,
        }
    }

    /// Rebuild a node from a record image (occupancy byte + buffer bytes)
    pub fn from_record(id: NodeId, record: &[u8], ctx: Arc<NodeContext<K, V>>) -> Result<Self> {
        if record.len() < 2 {
            return Err(TreeError::Corruption(format!(
                "record for node {} is {} bytes, too short for prefix and flag",
                id,
                record.len()
            )));
        }
        let stated = record[0] as usize;
        let kind = NodeKind::from_flag(record[1])?;
        let buf = record[1..].to_vec();
        let layout = ctx.layout();
        let occupancy = match layout.strategy() {
            super::LayoutStrategy::Variable => {
                let derived = layout.occupancy_for_length(buf.len())?;
                if derived != stated {
                    return Err(TreeError::Corruption(format!(
                        "node {}: occupancy prefix {} disagrees with buffer-derived {}",
                        id, stated, derived
                    )));
                }
                derived
            }
            super::LayoutStrategy::Fixed => {
                if buf.len() != layout.buffer_length(0) {
                    return Err(TreeError::Corruption(format!(
                        "node {}: fixed buffer is {} bytes, layout expects {}",
                        id,
                        buf.len(),
                        layout.buffer_length(0)
                    )));
                }
                if stated > layout.branching() {
                    return Err(TreeError::Corruption(format!(
                        "node {}: occupancy prefix {} exceeds branching {}",
                        id,
                        stated,
                        layout.branching()
                    )));
                }
                stated
            }
        };
        Ok(Self {
            id,
            kind,
            occupancy,
            buf,
            ctx,
        })
    }

    /// Serialize to a record image: occupancy byte followed by the buffer
    pub fn to_record(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(1 + self.buf.len());
        record.push(self.occupancy as u8);
        record.extend_from_slice(&self.buf);
        record
    }

    /// Node id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node kind
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// True for leaves
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// True for internal nodes
    pub fn is_internal(&self) -> bool {
        self.kind == NodeKind::Internal
    }

    /// Number of entries
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// True when the node holds no entries
    pub fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    /// Shared context of this node's tree
    pub fn context(&self) -> &Arc<NodeContext<K, V>> {
        &self.ctx
    }

    /// Right sibling id, if any
    pub fn link(&self) -> Result<Option<NodeId>> {
        let offset = self.ctx.layout().link_offset(self.occupancy);
        let id = self.ctx.link_codec().decode(&self.buf, offset)?;
        Ok(if id == NIL_NODE { None } else { Some(id) })
    }

    /// Set or clear the right sibling id
    pub fn set_link(&mut self, link: Option<NodeId>) -> Result<()> {
        if link == Some(self.id) {
            return Err(TreeError::InvalidArgument(format!(
                "node {} cannot link to itself",
                self.id
            )));
        }
        let offset = self.ctx.layout().link_offset(self.occupancy);
        let ctx = self.ctx.clone();
        ctx.link_codec()
            .encode(&link.unwrap_or(NIL_NODE), &mut self.buf, offset)
    }

    /// Key of entry `index`
    pub fn key_at(&self, index: usize) -> Result<K> {
        self.check_index(index)?;
        self.ctx
            .key_codec()
            .decode(&self.buf, self.ctx.layout().key_offset(index))
    }

    /// Value of entry `index`; leaves only
    pub fn value_at(&self, index: usize) -> Result<V> {
        if !self.is_leaf() {
            return Err(TreeError::InvalidArgument(format!(
                "node {} is internal, it has no values",
                self.id
            )));
        }
        self.check_index(index)?;
        self.ctx
            .value_codec()
            .decode(&self.buf, self.ctx.layout().payload_offset(index))
    }

    /// Child id of entry `index`; internal nodes only
    pub fn child_at(&self, index: usize) -> Result<NodeId> {
        if !self.is_internal() {
            return Err(TreeError::InvalidArgument(format!(
                "node {} is a leaf, it has no children",
                self.id
            )));
        }
        self.check_index(index)?;
        let child = self
            .ctx
            .link_codec()
            .decode(&self.buf, self.ctx.layout().payload_offset(index))?;
        if child == NIL_NODE {
            return Err(TreeError::Corruption(format!(
                "node {}: nil child pointer at entry {}",
                self.id, index
            )));
        }
        Ok(child)
    }

    /// Payload of entry `index`, dispatched by kind
    pub fn payload_at(&self, index: usize) -> Result<NodePayload<V>> {
        match self.kind {
            NodeKind::Leaf => Ok(NodePayload::Value(self.value_at(index)?)),
            NodeKind::Internal => Ok(NodePayload::Child(self.child_at(index)?)),
        }
    }

    /// Largest key, or `None` when empty
    ///
    /// The max key is the upper bound other nodes use to route here.
    pub fn max_key(&self) -> Result<Option<K>> {
        if self.occupancy == 0 {
            return Ok(None);
        }
        Ok(Some(self.key_at(self.occupancy - 1)?))
    }

    /// Binary search for `key`
    pub fn locate_key(&self, key: &K) -> Result<KeySlot> {
        let mut lo = 0usize;
        let mut hi = self.occupancy;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.ctx.compare_keys(&self.key_at(mid)?, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(KeySlot::Present(mid)),
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(KeySlot::Absent(lo))
    }

    /// Entry index whose payload is the child id, if present
    pub fn position_of_child(&self, child: NodeId) -> Result<Option<usize>> {
        for i in 0..self.occupancy {
            if self.child_at(i)? == child {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Insert an entry at `position`, shifting later entries right
    ///
    /// The caller keeps entries sorted and splits before the node would
    /// exceed the branching factor.
    pub fn insert_at(&mut self, position: usize, key: &K, payload: &NodePayload<V>) -> Result<()> {
        if position > self.occupancy {
            return Err(TreeError::InvalidArgument(format!(
                "insert position {} past occupancy {} in node {}",
                position, self.occupancy, self.id
            )));
        }
        let layout = self.ctx.layout().clone();
        let pair = layout.key_length() + layout.payload_length();
        // encode into a scratch pair first so a codec failure leaves the
        // buffer untouched
        let pair_buf = self.encode_pair(key, payload)?;
        let slot = layout.payload_offset(position);
        match layout.strategy() {
            super::LayoutStrategy::Variable => {
                self.buf.splice(slot..slot, std::iter::repeat(0u8).take(pair));
            }
            super::LayoutStrategy::Fixed => {
                if self.occupancy == layout.branching() {
                    return Err(TreeError::InvalidArgument(format!(
                        "node {} is full at {} entries",
                        self.id, self.occupancy
                    )));
                }
                let end = layout.payload_offset(self.occupancy);
                self.buf.copy_within(slot..end, slot + pair);
            }
        }
        self.buf[slot..slot + pair].copy_from_slice(&pair_buf);
        self.occupancy += 1;
        Ok(())
    }

    /// Remove the entry at `position`, shifting later entries left
    pub fn remove_at(&mut self, position: usize) -> Result<()> {
        self.check_index(position)?;
        let layout = self.ctx.layout().clone();
        let pair = layout.key_length() + layout.payload_length();
        let slot = layout.payload_offset(position);
        match layout.strategy() {
            super::LayoutStrategy::Variable => {
                self.buf.drain(slot..slot + pair);
            }
            super::LayoutStrategy::Fixed => {
                let end = layout.payload_offset(self.occupancy);
                self.buf.copy_within(slot + pair..end, slot);
                // zero the vacated tail slot
                self.buf[end - pair..end].fill(0);
            }
        }
        self.occupancy -= 1;
        Ok(())
    }

    /// Overwrite the payload of entry `position`, keeping its key
    pub fn set_payload_at(&mut self, position: usize, payload: &NodePayload<V>) -> Result<()> {
        self.check_index(position)?;
        self.check_payload_kind(payload)?;
        let layout = self.ctx.layout().clone();
        let width = layout.payload_length();
        let mut slot_buf = vec![0u8; width];
        match payload {
            NodePayload::Value(v) => self.ctx.value_codec().encode(v, &mut slot_buf, 0)?,
            NodePayload::Child(c) => self.ctx.link_codec().encode(c, &mut slot_buf, 0)?,
        }
        let slot = layout.payload_offset(position);
        self.buf[slot..slot + width].copy_from_slice(&slot_buf);
        Ok(())
    }

    /// Move the top half of this node's entries into `target`
    ///
    /// Moves `occupancy - occupancy / 2` entries (the larger keys). The
    /// target inherits this node's link and this node links to the target,
    /// so link-followers keep seeing every entry throughout a split.
    pub fn split_top_half_into(&mut self, target: &mut Node<K, V>) -> Result<()> {
        if self.occupancy == 0 {
            return Err(TreeError::Corruption(format!(
                "cannot split empty node {}",
                self.id
            )));
        }
        if target.occupancy != 0 {
            return Err(TreeError::Corruption(format!(
                "split target {} is not empty ({} entries)",
                target.id, target.occupancy
            )));
        }
        if target.kind != self.kind {
            return Err(TreeError::Corruption(format!(
                "split of {:?} node {} into {:?} target {}",
                self.kind, self.id, target.kind, target.id
            )));
        }
        let layout = self.ctx.layout().clone();
        let pair = layout.key_length() + layout.payload_length();
        let keep = self.occupancy / 2;
        let moved = self.occupancy - keep;
        let old_link = self.link()?;

        let src_start = layout.payload_offset(keep);
        let src_end = layout.payload_offset(self.occupancy);
        match layout.strategy() {
            super::LayoutStrategy::Variable => {
                let mut tbuf = vec![0u8; layout.buffer_length(moved)];
                tbuf[0] = target.kind.flag();
                tbuf[1..1 + moved * pair].copy_from_slice(&self.buf[src_start..src_end]);
                target.buf = tbuf;
                self.buf.drain(src_start..src_end);
            }
            super::LayoutStrategy::Fixed => {
                let dst_start = layout.payload_offset(0);
                target.buf[dst_start..dst_start + moved * pair]
                    .copy_from_slice(&self.buf[src_start..src_end]);
                self.buf[src_start..src_end].fill(0);
            }
        }
        target.occupancy = moved;
        self.occupancy = keep;
        target.set_link(old_link)?;
        self.set_link(Some(target.id))?;
        Ok(())
    }

    /// Structural checks a store runs before persisting a node
    pub fn validate(&self) -> Result<()> {
        let branching = self.ctx.branching();
        if self.occupancy > branching {
            return Err(TreeError::Corruption(format!(
                "node {} holds {} entries, branching factor is {}",
                self.id, self.occupancy, branching
            )));
        }
        if self.link()? == Some(self.id) {
            return Err(TreeError::Corruption(format!(
                "node {} links to itself",
                self.id
            )));
        }
        if self.is_internal() {
            for i in 0..self.occupancy {
                if self.child_at(i)? == self.id {
                    return Err(TreeError::Corruption(format!(
                        "node {} lists itself as child at entry {}",
                        self.id, i
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.occupancy {
            return Err(TreeError::InvalidArgument(format!(
                "entry index {} out of range in node {} with {} entries",
                index, self.id, self.occupancy
            )));
        }
        Ok(())
    }

    fn check_payload_kind(&self, payload: &NodePayload<V>) -> Result<()> {
        let matches = match (self.kind, payload) {
            (NodeKind::Leaf, NodePayload::Value(_)) => true,
            (NodeKind::Internal, NodePayload::Child(_)) => true,
            _ => false,
        };
        if !matches {
            return Err(TreeError::InvalidArgument(format!(
                "payload kind does not match {:?} node {}",
                self.kind, self.id
            )));
        }
        Ok(())
    }

    fn encode_pair(&self, key: &K, payload: &NodePayload<V>) -> Result<Vec<u8>> {
        self.check_payload_kind(payload)?;
        let layout = self.ctx.layout();
        let mut pair_buf = vec![0u8; layout.key_length() + layout.payload_length()];
        match payload {
            NodePayload::Value(v) => self.ctx.value_codec().encode(v, &mut pair_buf, 0)?,
            NodePayload::Child(c) => {
                if *c == NIL_NODE {
                    return Err(TreeError::InvalidArgument(format!(
                        "nil child payload for node {}",
                        self.id
                    )));
                }
                self.ctx.link_codec().encode(c, &mut pair_buf, 0)?;
            }
        }
        self.ctx
            .key_codec()
            .encode(key, &mut pair_buf, layout.payload_length())?;
        Ok(pair_buf)
    }
}

impl<K, V> PartialEq for Node<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.occupancy == other.occupancy && self.buf == other.buf
    }
}

impl<K, V> Eq for Node<K, V> {}

impl<K, V> Hash for Node<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.buf.hash(state);
    }
}

impl<K, V> fmt::Debug for Node<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("occupancy", &self.occupancy)
            .finish()
    }
}
