//! Bounded UTF-8 string codec
//!
//! Encodes a string as a one-byte length prefix followed by the UTF-8 bytes,
//! inside a slot sized for the configured maximum. The one-byte prefix caps
//! the maximum at 254 bytes.

use super::{check_slot, CodecDescriptor, ScalarCodec};
use crate::{Result, TreeError};
use std::cmp::Ordering;

/// Largest string length a one-byte prefix can carry
pub const MAX_UTF8_BYTES: usize = 254;

/// Length-prefixed UTF-8 codec with a configured maximum byte length
#[derive(Debug, Clone, Copy)]
pub struct Utf8Codec {
    max_bytes: usize,
}

impl Utf8Codec {
    /// Create a codec for strings up to `max_bytes` UTF-8 bytes
    pub fn new(max_bytes: usize) -> Result<Self> {
        if max_bytes == 0 || max_bytes > MAX_UTF8_BYTES {
            return Err(TreeError::InvalidArgument(format!(
                "utf8 codec max length must be in 1..={}, got {}",
                MAX_UTF8_BYTES, max_bytes
            )));
        }
        Ok(Self { max_bytes })
    }

    /// Configured maximum string length in bytes
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl ScalarCodec<String> for Utf8Codec {
    fn max_length(&self) -> usize {
        // length prefix + payload
        self.max_bytes + 1
    }

    fn encode(&self, value: &String, buf: &mut [u8], offset: usize) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > self.max_bytes {
            return Err(TreeError::Codec(format!(
                "string of {} bytes exceeds codec maximum of {}",
                bytes.len(),
                self.max_bytes
            )));
        }
        check_slot(buf.len(), offset, self.max_length())?;
        buf[offset] = bytes.len() as u8;
        buf[offset + 1..offset + 1 + bytes.len()].copy_from_slice(bytes);
        // clear the tail so slot reuse cannot leak previous content
        for b in &mut buf[offset + 1 + bytes.len()..offset + self.max_length()] {
            *b = 0;
        }
        Ok(())
    }

    fn decode(&self, buf: &[u8], offset: usize) -> Result<String> {
        check_slot(buf.len(), offset, self.max_length())?;
        let len = buf[offset] as usize;
        if len > self.max_bytes {
            return Err(TreeError::Codec(format!(
                "utf8 length prefix {} exceeds codec maximum of {}",
                len, self.max_bytes
            )));
        }
        let bytes = &buf[offset + 1..offset + 1 + len];
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TreeError::Codec(format!("invalid utf8 payload: {}", e)))
    }

    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor::new("utf8", self.max_length())
    }
}
