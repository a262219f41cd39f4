//! Error types for the B-link tree
//!
//! Everything fallible in the crate returns [`Result`]. A missing key is not
//! an error: lookups and removals report absence as `Ok(None)`. The error
//! variants separate caller mistakes ([`TreeError::InvalidArgument`],
//! [`TreeError::LockMisuse`]) from damaged or inconsistent state
//! ([`TreeError::Corruption`], [`TreeError::UnknownNode`]) so embedders can
//! decide what is retryable.

use crate::node::NodeId;
use thiserror::Error;

/// Result type for all tree operations
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors that can occur in tree operations
#[derive(Error, Debug)]
pub enum TreeError {
    /// IO error from the underlying storage
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller passed an argument outside the accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A node id that no store ever produced
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// On-disk or in-memory bytes violate the node format
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Key or value could not be encoded/decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Lock protocol violation (unlock without lock, wrong thread, relock)
    #[error("Lock misuse: {0}")]
    LockMisuse(String),

    /// Metadata document could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        TreeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TreeError::UnknownNode(42);
        assert_eq!(err.to_string(), "Unknown node: 42");

        let err = TreeError::Corruption("flag byte 0x07 at node 3".to_string());
        assert!(err.to_string().contains("flag byte 0x07"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TreeError = io.into();
        assert!(matches!(err, TreeError::Io(_)));
    }
}
