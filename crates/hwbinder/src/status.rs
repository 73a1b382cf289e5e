//! Transport status codes
//!
//! Status values travel as `i32` in replies. The mapping from codes is
//! total: any value this crate does not know becomes [`Status::Unknown`].

use std::fmt;

/// Transport-level outcome of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    NoMemory,
    InvalidOperation,
    BadValue,
    BadIndex,
    NameNotFound,
    PermissionDenied,
    NoInit,
    AlreadyExists,
    DeadObject,
    FailedTransaction,
    BadType,
    UnknownError,
    /// A code with no named meaning
    Unknown(i32),
}

impl Status {
    pub const OK: i32 = 0;
    pub const NO_MEMORY: i32 = -12;
    pub const INVALID_OPERATION: i32 = -38;
    pub const BAD_VALUE: i32 = -22;
    pub const BAD_INDEX: i32 = -75;
    pub const NAME_NOT_FOUND: i32 = -2;
    pub const PERMISSION_DENIED: i32 = -1;
    pub const NO_INIT: i32 = -19;
    pub const ALREADY_EXISTS: i32 = -17;
    pub const DEAD_OBJECT: i32 = -32;
    pub const UNKNOWN_ERROR: i32 = i32::MIN;
    pub const BAD_TYPE: i32 = i32::MIN + 1;
    pub const FAILED_TRANSACTION: i32 = i32::MIN + 2;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::OK => Status::Ok,
            Self::NO_MEMORY => Status::NoMemory,
            Self::INVALID_OPERATION => Status::InvalidOperation,
            Self::BAD_VALUE => Status::BadValue,
            Self::BAD_INDEX => Status::BadIndex,
            Self::NAME_NOT_FOUND => Status::NameNotFound,
            Self::PERMISSION_DENIED => Status::PermissionDenied,
            Self::NO_INIT => Status::NoInit,
            Self::ALREADY_EXISTS => Status::AlreadyExists,
            Self::DEAD_OBJECT => Status::DeadObject,
            Self::FAILED_TRANSACTION => Status::FailedTransaction,
            Self::BAD_TYPE => Status::BadType,
            Self::UNKNOWN_ERROR => Status::UnknownError,
            other => Status::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Status::Ok => Self::OK,
            Status::NoMemory => Self::NO_MEMORY,
            Status::InvalidOperation => Self::INVALID_OPERATION,
            Status::BadValue => Self::BAD_VALUE,
            Status::BadIndex => Self::BAD_INDEX,
            Status::NameNotFound => Self::NAME_NOT_FOUND,
            Status::PermissionDenied => Self::PERMISSION_DENIED,
            Status::NoInit => Self::NO_INIT,
            Status::AlreadyExists => Self::ALREADY_EXISTS,
            Status::DeadObject => Self::DEAD_OBJECT,
            Status::FailedTransaction => Self::FAILED_TRANSACTION,
            Status::BadType => Self::BAD_TYPE,
            Status::UnknownError => Self::UNKNOWN_ERROR,
            Status::Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::NoMemory => "NO_MEMORY",
            Status::InvalidOperation => "INVALID_OPERATION",
            Status::BadValue => "BAD_VALUE",
            Status::BadIndex => "BAD_INDEX",
            Status::NameNotFound => "NAME_NOT_FOUND",
            Status::PermissionDenied => "PERMISSION_DENIED",
            Status::NoInit => "NO_INIT",
            Status::AlreadyExists => "ALREADY_EXISTS",
            Status::DeadObject => "DEAD_OBJECT",
            Status::FailedTransaction => "FAILED_TRANSACTION",
            Status::BadType => "BAD_TYPE",
            Status::UnknownError => "UNKNOWN_ERROR",
            Status::Unknown(code) => return write!(f, "status {}", code),
        };
        f.write_str(name)
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        Status::from_code(code)
    }
}

/// Error categories surfaced to callers of a proxy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallerError {
    OutOfMemory,
    Unsupported,
    IllegalArgument,
    IndexOutOfBounds,
    NoSuchElement,
    Security,
    NotInitialized,
    AlreadyExists,
    DeadObject,
    TransactionFailed,
    /// Catch-all carrying the raw code
    Unknown(i32),
}

impl fmt::Display for CallerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerError::OutOfMemory => f.write_str("out of memory"),
            CallerError::Unsupported => f.write_str("unsupported operation"),
            CallerError::IllegalArgument => f.write_str("illegal argument"),
            CallerError::IndexOutOfBounds => f.write_str("index out of bounds"),
            CallerError::NoSuchElement => f.write_str("no such element"),
            CallerError::Security => f.write_str("permission denied"),
            CallerError::NotInitialized => f.write_str("not initialized"),
            CallerError::AlreadyExists => f.write_str("already exists"),
            CallerError::DeadObject => f.write_str("remote object is dead"),
            CallerError::TransactionFailed => f.write_str("transaction failed"),
            CallerError::Unknown(code) => write!(f, "unknown error {}", code),
        }
    }
}

/// Map a transport status to what the caller sees; `None` means success
pub fn wire_error_to_caller_error(status: Status) -> Option<CallerError> {
    let error = match status {
        Status::Ok => return None,
        Status::NoMemory => CallerError::OutOfMemory,
        Status::InvalidOperation => CallerError::Unsupported,
        Status::BadValue | Status::BadType => CallerError::IllegalArgument,
        Status::BadIndex => CallerError::IndexOutOfBounds,
        Status::NameNotFound => CallerError::NoSuchElement,
        Status::PermissionDenied => CallerError::Security,
        Status::NoInit => CallerError::NotInitialized,
        Status::AlreadyExists => CallerError::AlreadyExists,
        Status::DeadObject => CallerError::DeadObject,
        Status::FailedTransaction => CallerError::TransactionFailed,
        Status::UnknownError => CallerError::Unknown(Status::UNKNOWN_ERROR),
        Status::Unknown(code) => CallerError::Unknown(code),
    };
    Some(error)
}
