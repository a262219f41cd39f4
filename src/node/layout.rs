//! Node buffer layouts
//!
//! A layout turns (entry index, occupancy) into byte offsets inside a node
//! buffer. Slot widths are always the codec maximum widths; the two
//! strategies differ only in how the buffer tracks occupancy:
//!
//! - [`FixedLayout`] allocates all `L` slots up front. The buffer length is
//!   constant and the occupancy must be carried beside the buffer.
//! - [`VariableLayout`] sizes the buffer to the current occupancy, so the
//!   occupancy is derivable from the buffer length alone. Inserts and
//!   removals resize the buffer.
//!
//! Both satisfy `record_length(n) = 1 + n * (key_len + payload_len) +
//! link_len`, the length of the live bytes of a node holding `n` entries.

use crate::{Result, TreeError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Smallest supported branching factor
pub const MIN_BRANCHING: usize = 2;

/// Largest supported branching factor; occupancy must fit a signed byte in
/// the record prefix
pub const MAX_BRANCHING: usize = 127;

/// Which buffer strategy a tree uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutStrategy {
    /// Buffers hold all `L` slots regardless of occupancy
    Fixed,
    /// Buffers grow and shrink with occupancy
    Variable,
}

impl Default for LayoutStrategy {
    fn default() -> Self {
        LayoutStrategy::Variable
    }
}

/// Byte-offset arithmetic for one node buffer shape
pub trait NodeLayout: Send + Sync {
    /// Strategy implemented by this layout
    fn strategy(&self) -> LayoutStrategy;

    /// Maximum entries per node (`L`)
    fn branching(&self) -> usize;

    /// Width of one key slot
    fn key_length(&self) -> usize;

    /// Width of one payload slot
    fn payload_length(&self) -> usize;

    /// Width of the trailing link field
    fn link_length(&self) -> usize;

    /// Offset of the payload slot of entry `index`
    fn payload_offset(&self, index: usize) -> usize;

    /// Offset of the key slot of entry `index`
    fn key_offset(&self, index: usize) -> usize;

    /// Length of the live bytes of a node with `occupancy` entries
    fn record_length(&self, occupancy: usize) -> usize;

    /// Length of the allocated buffer for `occupancy` entries
    fn buffer_length(&self, occupancy: usize) -> usize;

    /// Offset of the link field for `occupancy` entries
    fn link_offset(&self, occupancy: usize) -> usize;

    /// Derive occupancy from a buffer length, if the strategy permits
    fn occupancy_for_length(&self, length: usize) -> Result<usize>;
}

/// Dimensions shared by both strategies
#[derive(Debug, Clone, Copy)]
struct LayoutDims {
    branching: usize,
    key_len: usize,
    payload_len: usize,
    link_len: usize,
}

impl LayoutDims {
    fn new(branching: usize, key_len: usize, payload_len: usize, link_len: usize) -> Result<Self> {
        if !(MIN_BRANCHING..=MAX_BRANCHING).contains(&branching) {
            return Err(TreeError::InvalidArgument(format!(
                "branching factor must be in {}..={}, got {}",
                MIN_BRANCHING, MAX_BRANCHING, branching
            )));
        }
        if key_len == 0 || link_len == 0 {
            return Err(TreeError::InvalidArgument(
                "key and link widths must be non-zero".to_string(),
            ));
        }
        if payload_len < link_len {
            // payload slots double as child-id slots in internal nodes
            return Err(TreeError::InvalidArgument(format!(
                "payload width {} cannot be narrower than link width {}",
                payload_len, link_len
            )));
        }
        Ok(Self {
            branching,
            key_len,
            payload_len,
            link_len,
        })
    }

    fn pair(&self) -> usize {
        self.key_len + self.payload_len
    }

    fn payload_offset(&self, index: usize) -> usize {
        1 + index * self.pair()
    }

    fn key_offset(&self, index: usize) -> usize {
        self.payload_offset(index) + self.payload_len
    }

    fn record_length(&self, occupancy: usize) -> usize {
        1 + occupancy * self.pair() + self.link_len
    }
}

macro_rules! delegate_dims {
    () => {
        fn branching(&self) -> usize {
            self.dims.branching
        }

        fn key_length(&self) -> usize {
            self.dims.key_len
        }

        fn payload_length(&self) -> usize {
            self.dims.payload_len
        }

        fn link_length(&self) -> usize {
            self.dims.link_len
        }

        fn payload_offset(&self, index: usize) -> usize {
            self.dims.payload_offset(index)
        }

        fn key_offset(&self, index: usize) -> usize {
            self.dims.key_offset(index)
        }

        fn record_length(&self, occupancy: usize) -> usize {
            self.dims.record_length(occupancy)
        }
    };
}

/// Layout with all slots allocated up front
#[derive(Debug, Clone)]
pub struct FixedLayout {
    dims: LayoutDims,
}

impl FixedLayout {
    /// Build a fixed layout; widths are codec maximum widths
    pub fn new(
        branching: usize,
        key_len: usize,
        payload_len: usize,
        link_len: usize,
    ) -> Result<Self> {
        Ok(Self {
            dims: LayoutDims::new(branching, key_len, payload_len, link_len)?,
        })
    }
}

impl NodeLayout for FixedLayout {
    delegate_dims!();

    fn strategy(&self) -> LayoutStrategy {
        LayoutStrategy::Fixed
    }

    fn buffer_length(&self, _occupancy: usize) -> usize {
        self.dims.record_length(self.dims.branching)
    }

    fn link_offset(&self, _occupancy: usize) -> usize {
        1 + self.dims.branching * self.dims.pair()
    }

    fn occupancy_for_length(&self, _length: usize) -> Result<usize> {
        Err(TreeError::InvalidArgument(
            "fixed layout cannot derive occupancy from buffer length".to_string(),
        ))
    }
}

/// Layout sized to the current occupancy
#[derive(Debug, Clone)]
pub struct VariableLayout {
    dims: LayoutDims,
}

impl VariableLayout {
    /// Build a variable layout; widths are codec maximum widths
    pub fn new(
        branching: usize,
        key_len: usize,
        payload_len: usize,
        link_len: usize,
    ) -> Result<Self> {
        Ok(Self {
            dims: LayoutDims::new(branching, key_len, payload_len, link_len)?,
        })
    }
}

impl NodeLayout for VariableLayout {
    delegate_dims!();

    fn strategy(&self) -> LayoutStrategy {
        LayoutStrategy::Variable
    }

    fn buffer_length(&self, occupancy: usize) -> usize {
        self.dims.record_length(occupancy)
    }

    fn link_offset(&self, occupancy: usize) -> usize {
        1 + occupancy * self.dims.pair()
    }

    fn occupancy_for_length(&self, length: usize) -> Result<usize> {
        let overhead = 1 + self.dims.link_len;
        if length < overhead {
            return Err(TreeError::Corruption(format!(
                "buffer of {} bytes is shorter than the {} byte node overhead",
                length, overhead
            )));
        }
        let body = length - overhead;
        if body % self.dims.pair() != 0 {
            return Err(TreeError::Corruption(format!(
                "buffer body of {} bytes is not a multiple of the {} byte entry pair",
                body,
                self.dims.pair()
            )));
        }
        let occupancy = body / self.dims.pair();
        if occupancy > self.dims.branching {
            return Err(TreeError::Corruption(format!(
                "buffer holds {} entries, branching factor is {}",
                occupancy, self.dims.branching
            )));
        }
        Ok(occupancy)
    }
}

/// Build the layout for a strategy from codec widths
pub fn build_layout(
    strategy: LayoutStrategy,
    branching: usize,
    key_len: usize,
    payload_len: usize,
    link_len: usize,
) -> Result<Arc<dyn NodeLayout>> {
    Ok(match strategy {
        LayoutStrategy::Fixed => {
            Arc::new(FixedLayout::new(branching, key_len, payload_len, link_len)?)
        }
        LayoutStrategy::Variable => Arc::new(VariableLayout::new(
            branching,
            key_len,
            payload_len,
            link_len,
        )?),
    })
}
