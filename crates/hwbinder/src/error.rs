//! Binder error types

use crate::status::{wire_error_to_caller_error, CallerError, Status};
use hidl_wire::WireError;
use thiserror::Error;

/// Result type for binder operations
pub type Result<T> = std::result::Result<T, BinderError>;

/// Errors raised by parcels, arenas, the dispatcher and proxies
#[derive(Error, Debug)]
pub enum BinderError {
    /// Access outside a blob or buffer
    #[error("range error: {0}")]
    Range(String),

    /// Arena or native allocation refused
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Malformed wire data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation not permitted here
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// `send()` called a second time
    #[error("transaction already replied")]
    AlreadyReplied,

    /// No matching death record
    #[error("not found: {0}")]
    NotFound(String),

    /// Opaque failure raised by handler logic
    #[error("handler error: {0}")]
    Handler(String),

    /// Status reported by the transport or the peer
    #[error("transport status {0}")]
    Status(Status),
}

impl BinderError {
    /// Status reported to the peer when this error ends a transaction
    pub fn status(&self) -> Status {
        match self {
            BinderError::Range(_) => Status::BadIndex,
            BinderError::Allocation(_) => Status::NoMemory,
            BinderError::Protocol(_) => Status::BadValue,
            BinderError::UnsupportedOperation(_) => Status::InvalidOperation,
            BinderError::AlreadyReplied => Status::InvalidOperation,
            BinderError::NotFound(_) => Status::NameNotFound,
            BinderError::Handler(_) => Status::UnknownError,
            BinderError::Status(status) => *status,
        }
    }

    /// Caller-visible category of this error
    pub fn caller_error(&self) -> CallerError {
        wire_error_to_caller_error(self.status()).unwrap_or(CallerError::Unknown(Status::OK))
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        BinderError::Handler(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        BinderError::UnsupportedOperation(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        BinderError::Protocol(msg.into())
    }
}

impl From<WireError> for BinderError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Range { .. } => BinderError::Range(err.to_string()),
            WireError::Allocation(msg) => BinderError::Allocation(msg),
            WireError::Unsupported(msg) => BinderError::UnsupportedOperation(msg),
            WireError::KindAlreadySet(_) => BinderError::UnsupportedOperation(err.to_string()),
            WireError::Underflow { .. } | WireError::Protocol(_) | WireError::Utf8(_) => {
                BinderError::Protocol(err.to_string())
            }
        }
    }
}

impl From<Status> for BinderError {
    fn from(status: Status) -> Self {
        BinderError::Status(status)
    }
}
