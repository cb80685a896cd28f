//! Error types for capture streaming and scene reconstruction

use thiserror::Error;

/// Result type alias for stream and reconstruction operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while producing or consuming a capture stream
#[derive(Error, Debug)]
pub enum Error {
    /// A message could not be decoded from the transport
    #[error("Malformed message: {0}")]
    TransportDecode(String),

    /// An IR record failed validation at the parse boundary
    #[error("Invalid node record: {0}")]
    InvalidNode(String),

    /// Assembly was requested before every chunk arrived
    #[error("Asset {asset_id} incomplete: {received}/{total} chunks")]
    AssemblyIncomplete {
        asset_id: String,
        received: u32,
        total: u32,
    },

    /// An asset never completed within its timeout
    #[error("Asset {0} timed out before all chunks arrived")]
    AssemblyTimeout(String),

    /// An asset was pushed out by the in-flight or buffered-bytes limit
    #[error("Asset {0} evicted: assembly limits exceeded")]
    AssemblyOverflow(String),

    /// Reassembled byte count disagrees with the declared size
    #[error("Asset {asset_id} size mismatch: declared {declared} bytes, assembled {actual}")]
    SizeMismatch {
        asset_id: String,
        declared: u64,
        actual: u64,
    },

    /// Reassembled bytes do not hash to the declared digest
    #[error("Asset {0} digest mismatch")]
    DigestMismatch(String),

    /// A chunk carried an index or total inconsistent with its assembly
    #[error("Invalid chunk for asset {asset_id}: {reason}")]
    InvalidChunk { asset_id: String, reason: String },

    /// The host failed to create a native primitive for one node
    #[error("Failed to create node {node_id}: {reason}")]
    NodeCreation { node_id: String, reason: String },

    /// The peer end of the transport is gone
    #[error("Transport closed")]
    TransportClosed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure only affects a single asset and should be
    /// resolved by substituting a placeholder.
    pub fn is_asset_failure(&self) -> bool {
        matches!(
            self,
            Error::AssemblyTimeout(_)
                | Error::AssemblyOverflow(_)
                | Error::SizeMismatch { .. }
                | Error::DigestMismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_failures_are_classified() {
        assert!(Error::AssemblyTimeout("img".into()).is_asset_failure());
        assert!(Error::DigestMismatch("img".into()).is_asset_failure());
        assert!(Error::AssemblyOverflow("img".into()).is_asset_failure());
        assert!(!Error::TransportClosed.is_asset_failure());
    }

    #[test]
    fn incomplete_message_mentions_counts() {
        let e = Error::AssemblyIncomplete {
            asset_id: "hero".into(),
            received: 3,
            total: 5,
        };
        assert_eq!(e.to_string(), "Asset hero incomplete: 3/5 chunks");
    }
}
