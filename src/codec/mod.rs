//! Key, value and link codecs
//!
//! Nodes store keys and payloads as raw bytes inside a shared buffer, so every
//! key/value type the tree handles comes with a [`ScalarCodec`]: a fixed upper
//! bound on the encoded width, encode/decode into a caller-provided slot, and
//! the ordering the tree sorts by. Codecs are instance-based (not purely
//! static) so bounded types like UTF-8 strings can carry their configured
//! maximum width.
//!
//! ## Provided codecs
//! - [`I32Codec`], [`I64Codec`], [`U64Codec`]: order-preserving big-endian
//!   integers (signed values are sign-flipped so byte order equals numeric
//!   order)
//! - [`Utf8Codec`]: length-prefixed UTF-8 strings with a configured maximum
//!
//! The disk store persists a [`CodecDescriptor`] per codec and refuses to
//! reopen a tree with mismatched codecs.

mod primitives;
mod text;

pub use primitives::{I32Codec, I64Codec, U64Codec};
pub use text::Utf8Codec;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Encodes, decodes and orders one scalar type inside node buffers
pub trait ScalarCodec<T>: Send + Sync {
    /// Maximum number of bytes an encoded value occupies
    fn max_length(&self) -> usize;

    /// Encode `value` into `buf` starting at `offset`
    ///
    /// The slot `buf[offset..offset + max_length()]` is owned by this value;
    /// bytes past the encoded width stay zero.
    fn encode(&self, value: &T, buf: &mut [u8], offset: usize) -> Result<()>;

    /// Decode a value from `buf` starting at `offset`
    fn decode(&self, buf: &[u8], offset: usize) -> Result<T>;

    /// Total order the tree sorts by
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Stable identity persisted in the tree metadata
    fn descriptor(&self) -> CodecDescriptor;
}

/// Persisted identity of a codec: type tag plus configured width
///
/// Two codecs are interchangeable exactly when their descriptors are equal;
/// the disk store compares descriptors on reopen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    /// Short type tag, e.g. `"i64"` or `"utf8"`
    pub type_tag: String,
    /// Maximum encoded width in bytes
    pub max_length: usize,
}

impl CodecDescriptor {
    /// Build a descriptor from a tag and width
    pub fn new(type_tag: impl Into<String>, max_length: usize) -> Self {
        Self {
            type_tag: type_tag.into(),
            max_length,
        }
    }
}

/// Checks that a codec slot fits inside the buffer
pub(crate) fn check_slot(buf_len: usize, offset: usize, width: usize) -> Result<()> {
    if offset + width > buf_len {
        return Err(crate::TreeError::Codec(format!(
            "codec slot [{}..{}] exceeds buffer of {} bytes",
            offset,
            offset + width,
            buf_len
        )));
    }
    Ok(())
}
