//! Fixed-width integer codecs
//!
//! All three codecs write big-endian bytes; the signed ones flip the sign bit
//! first so the byte order of encoded keys equals the numeric order. The tree
//! compares through [`ScalarCodec::compare`], but order-preserving bytes keep
//! on-disk images amenable to raw inspection and future prefix tricks.

use super::{check_slot, CodecDescriptor, ScalarCodec};
use crate::Result;
use std::cmp::Ordering;

/// Order-preserving codec for `i32` (4 bytes)
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Codec;

impl ScalarCodec<i32> for I32Codec {
    fn max_length(&self) -> usize {
        4
    }

    fn encode(&self, value: &i32, buf: &mut [u8], offset: usize) -> Result<()> {
        check_slot(buf.len(), offset, 4)?;
        let flipped = (*value as u32) ^ 0x8000_0000;
        buf[offset..offset + 4].copy_from_slice(&flipped.to_be_bytes());
        Ok(())
    }

    fn decode(&self, buf: &[u8], offset: usize) -> Result<i32> {
        check_slot(buf.len(), offset, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[offset..offset + 4]);
        Ok((u32::from_be_bytes(raw) ^ 0x8000_0000) as i32)
    }

    fn compare(&self, a: &i32, b: &i32) -> Ordering {
        a.cmp(b)
    }

    fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor::new("i32", 4)
    }
}

/// Order-preserving codec for `i64` (8 bytes)
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl ScalarCodec<i64> for I64Codec {
    fn max_length(&self) -> usize {
        8
    }

    fn encode(&self, value: &i64, buf: &mut [u8], offset: usize) -> Result<()> {
        check_slot(buf.len(), offset, 8)?;
        let flipped = (*value as u64) ^ 0x8000_0000_0000_0000;
        buf[offset..offset + 8].copy_from_slice(&flipped.to_be_bytes());
        Ok(())
    }

    fn decode(&self, buf: &[u8], offset: usize) -> Result<i64> {
        check_slot(buf.len(), offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        Ok((u64::from_be_bytes(raw) ^ 0x8000_0000_0000_0000) as i64)
    }

    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor::new("i64", 8)
    }
}

/// Big-endian codec for `u64` (8 bytes)
///
/// Also serves as the child-link codec: node ids are `u64` and an all-zero
/// slot decodes to the nil id.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl ScalarCodec<u64> for U64Codec {
    fn max_length(&self) -> usize {
        8
    }

    fn encode(&self, value: &u64, buf: &mut [u8], offset: usize) -> Result<()> {
        check_slot(buf.len(), offset, 8)?;
        buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn decode(&self, buf: &[u8], offset: usize) -> Result<u64> {
        check_slot(buf.len(), offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        Ok(u64::from_be_bytes(raw))
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor::new("u64", 8)
    }
}
