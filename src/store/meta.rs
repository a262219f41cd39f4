//! Tree metadata document
//!
//! A small JSON document next to the node files records everything needed
//! to reopen a tree: layout parameters, codec descriptors, the current root
//! id and the id allocator position. The document carries a CRC32 checksum
//! over its own serialized form and is replaced atomically (write to a
//! temporary file, fsync, rename, fsync the directory), so a crash leaves
//! either the old or the new document, never a torn one.
//!
//! On reopen the stored descriptors are compared against the codecs the
//! caller configured; opening a tree with mismatched codecs would silently
//! misread every node, so it is refused up front.

use crate::codec::CodecDescriptor;
use crate::node::{LayoutStrategy, NodeContext, NodeId};
use crate::{Result, TreeError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// Current metadata format version
pub const META_FORMAT_VERSION: u32 = 1;

/// File name of the metadata document inside the tree directory
pub const META_FILE_NAME: &str = "blink.meta";

/// Persistent description of a tree directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeMeta {
    pub format_version: u32,
    pub branching: usize,
    pub layout: LayoutStrategy,
    pub key_codec: CodecDescriptor,
    pub value_codec: CodecDescriptor,
    pub link_codec: CodecDescriptor,
    pub root_id: NodeId,
    pub next_id: NodeId,
    /// CRC32 of the document serialized with this field set to zero
    pub checksum: u32,
}

impl TreeMeta {
    /// Capture the current state of a tree as a metadata document
    pub fn snapshot<K, V>(
        ctx: &NodeContext<K, V>,
        root_id: NodeId,
        next_id: NodeId,
    ) -> Result<Self> {
        let mut meta = Self {
            format_version: META_FORMAT_VERSION,
            branching: ctx.branching(),
            layout: ctx.layout().strategy(),
            key_codec: ctx.key_codec().descriptor(),
            value_codec: ctx.value_codec().descriptor(),
            link_codec: ctx.link_codec().descriptor(),
            root_id,
            next_id,
            checksum: 0,
        };
        meta.checksum = meta.compute_checksum()?;
        Ok(meta)
    }

    /// Path of the metadata document inside `dir`
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(META_FILE_NAME)
    }

    /// Whether `dir` already holds a metadata document
    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).exists()
    }

    /// Read and verify the document stored in `dir`
    pub fn read_current(dir: &Path) -> Result<Self> {
        let file = File::open(Self::path(dir))?;
        let meta: TreeMeta = serde_json::from_reader(BufReader::new(file))?;
        meta.verify_checksum()?;
        if meta.format_version != META_FORMAT_VERSION {
            return Err(TreeError::Corruption(format!(
                "metadata format version {} is not supported (expected {})",
                meta.format_version, META_FORMAT_VERSION
            )));
        }
        Ok(meta)
    }

    /// Atomically replace the document in `dir` with this one
    pub fn write_atomic(&self, dir: &Path) -> Result<()> {
        let target = Self::path(dir);
        let tmp = dir.join(format!("{}.tmp", META_FILE_NAME));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;

        // make the rename itself durable
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let dir_file = File::open(dir)?;
            let rc = unsafe { libc::fsync(dir_file.as_raw_fd()) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Check the stored checksum against the document body
    pub fn verify_checksum(&self) -> Result<()> {
        let expected = self.compute_checksum()?;
        if self.checksum != expected {
            return Err(TreeError::Corruption(format!(
                "metadata checksum mismatch: stored {:#010x}, computed {:#010x}",
                self.checksum, expected
            )));
        }
        Ok(())
    }

    /// Refuse to reopen with a configuration the files were not written with
    pub fn validate_against<K, V>(&self, ctx: &NodeContext<K, V>) -> Result<()> {
        if self.branching != ctx.branching() {
            return Err(TreeError::InvalidArgument(format!(
                "tree was created with branching {}, reopened with {}",
                self.branching,
                ctx.branching()
            )));
        }
        if self.layout != ctx.layout().strategy() {
            return Err(TreeError::InvalidArgument(format!(
                "tree was created with {:?} layout, reopened with {:?}",
                self.layout,
                ctx.layout().strategy()
            )));
        }
        let pairs = [
            ("key", &self.key_codec, ctx.key_codec().descriptor()),
            ("value", &self.value_codec, ctx.value_codec().descriptor()),
            ("link", &self.link_codec, ctx.link_codec().descriptor()),
        ];
        for (name, stored, configured) in pairs {
            if *stored != configured {
                return Err(TreeError::Codec(format!(
                    "{} codec mismatch: tree stores {} ({} bytes), configured {} ({} bytes)",
                    name,
                    stored.type_tag,
                    stored.max_length,
                    configured.type_tag,
                    configured.max_length
                )));
            }
        }
        Ok(())
    }

    fn compute_checksum(&self) -> Result<u32> {
        let mut body = self.clone();
        body.checksum = 0;
        Ok(crc32fast::hash(&serde_json::to_vec(&body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I32Codec, I64Codec, U64Codec};
    use tempfile::tempdir;

    fn ctx() -> NodeContext<i64, i64> {
        NodeContext::new(LayoutStrategy::Variable, 16, I64Codec, I64Codec, U64Codec).unwrap()
    }

    #[test]
    fn test_snapshot_checksum_is_valid() {
        let meta = TreeMeta::snapshot(&ctx(), 1, 2).unwrap();
        meta.verify_checksum().unwrap();
        assert_eq!(meta.format_version, META_FORMAT_VERSION);
        assert_eq!(meta.root_id, 1);
        assert_eq!(meta.next_id, 2);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let meta = TreeMeta::snapshot(&ctx(), 5, 17).unwrap();
        meta.write_atomic(dir.path()).unwrap();

        assert!(TreeMeta::exists(dir.path()));
        let loaded = TreeMeta::read_current(dir.path()).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_rewrite_replaces_document() {
        let dir = tempdir().unwrap();
        TreeMeta::snapshot(&ctx(), 1, 2)
            .unwrap()
            .write_atomic(dir.path())
            .unwrap();
        TreeMeta::snapshot(&ctx(), 9, 40)
            .unwrap()
            .write_atomic(dir.path())
            .unwrap();

        let loaded = TreeMeta::read_current(dir.path()).unwrap();
        assert_eq!(loaded.root_id, 9);
        assert_eq!(loaded.next_id, 40);
    }

    #[test]
    fn test_tampered_document_rejected() {
        let dir = tempdir().unwrap();
        TreeMeta::snapshot(&ctx(), 3, 8)
            .unwrap()
            .write_atomic(dir.path())
            .unwrap();

        let path = TreeMeta::path(dir.path());
        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("\"root_id\": 3", "\"root_id\": 4");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(
            TreeMeta::read_current(dir.path()).unwrap_err(),
            TreeError::Corruption(_)
        ));
    }

    #[test]
    fn test_missing_document_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            TreeMeta::read_current(dir.path()).unwrap_err(),
            TreeError::Io(_)
        ));
    }

    #[test]
    fn test_codec_mismatch_refused() {
        let meta = {
            let other =
                NodeContext::new(LayoutStrategy::Variable, 16, I32Codec, I64Codec, U64Codec)
                    .unwrap();
            TreeMeta::snapshot(&other, 1, 2).unwrap()
        };
        assert!(matches!(
            meta.validate_against(&ctx()).unwrap_err(),
            TreeError::Codec(_)
        ));
    }

    #[test]
    fn test_branching_mismatch_refused() {
        let meta = {
            let other =
                NodeContext::new(LayoutStrategy::Variable, 8, I64Codec, I64Codec, U64Codec)
                    .unwrap();
            TreeMeta::snapshot(&other, 1, 2).unwrap()
        };
        assert!(matches!(
            meta.validate_against(&ctx()).unwrap_err(),
            TreeError::InvalidArgument(_)
        ));
    }
}
