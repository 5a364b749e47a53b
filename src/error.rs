use std::fmt;
use std::io;

use crate::value::ValueKind;

/// Custom error type for pathdb operations
#[derive(Debug)]
pub enum Error {
    /// I/O error from underlying file operations
    Io(io::Error),
    /// Write attempt on a read transaction or a read-only engine
    ReadOnly,
    /// Key never existed at the requested serial, or was deleted by then
    KeyAbsent(String),
    /// Value does not match the kind declared for the key
    TypeMismatch {
        relpath: String,
        expected: ValueKind,
        found: ValueKind,
    },
    /// Illegal parameter passed to a parameterized key
    InvalidParam(String),
    /// Error when the changelog file is locked by another process
    FileLocked(String),
    /// Error when persisted state is inconsistent or unreadable
    Corrupted(String),
    /// Other engine errors
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::ReadOnly => write!(f, "write attempted on a read-only transaction or engine"),
            Error::KeyAbsent(what) => write!(f, "key absent: {what}"),
            Error::TypeMismatch {
                relpath,
                expected,
                found,
            } => write!(
                f,
                "key {relpath} requires value of kind {expected}, got {found}"
            ),
            Error::InvalidParam(msg) => write!(f, "invalid key parameter: {msg}"),
            Error::FileLocked(msg) => write!(f, "changelog file is locked: {msg}"),
            Error::Corrupted(msg) => write!(f, "store corrupted: {msg}"),
            Error::Other(msg) => write!(f, "engine error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Result type for pathdb operations
pub type Result<T> = std::result::Result<T, Error>;
