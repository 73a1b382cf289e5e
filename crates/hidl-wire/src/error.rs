//! Wire error types

use thiserror::Error;

/// Errors raised while building or reading wire buffers and blobs
#[derive(Debug, Error)]
pub enum WireError {
    /// Access outside the extent of a blob or buffer
    #[error("range error: offset {offset} + {len} exceeds length {length}")]
    Range {
        offset: usize,
        len: usize,
        length: usize,
    },

    /// Not enough data left in the inline stream
    #[error("buffer underflow: needed {needed} bytes, have {have}")]
    Underflow { needed: usize, have: usize },

    /// Malformed wire data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation not permitted for this blob or object
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Allocation request refused
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Blob kind was already specialized
    #[error("blob kind already set to {0:?}")]
    KindAlreadySet(crate::BlobKind),

    /// UTF-8 decoding error in string payloads
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl WireError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WireError::Protocol(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        WireError::Unsupported(msg.into())
    }
}

/// Result type for wire operations
pub type Result<T> = std::result::Result<T, WireError>;
