//! Error type for keywell operations
//!
//! Every fallible operation in the engine surfaces one of seven error
//! kinds. The kinds mirror how callers are expected to react:
//!
//! - `NotOpened`, `Invalid`, `NoPermission` — caller misuse; fix the call
//! - `NoRecord` — a miss, not a failure; the database is healthy
//! - `Logic` — an internal invariant was found violated at runtime
//! - `Broken`, `System` — corruption or I/O failure; these are *fatal*:
//!   the engine stamps a sticky flag into the file header so the next
//!   open knows the image needs to be rebuilt.

use thiserror::Error;

/// Result type used throughout keywell
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by database operations
#[derive(Error, Debug)]
pub enum Error {
    /// The database handle is not in an opened state
    #[error("not opened: {0}")]
    NotOpened(String),

    /// Misuse of the API or a format mismatch
    #[error("invalid operation: {0}")]
    Invalid(String),

    /// The open mode does not permit the operation
    #[error("permission denied: {0}")]
    NoPermission(String),

    /// The key was not found, or a cursor ran off the end
    #[error("no record: {0}")]
    NoRecord(String),

    /// An internal invariant did not hold
    #[error("logical inconsistency: {0}")]
    Logic(String),

    /// The on-disk image is corrupted
    #[error("broken file: {0}")]
    Broken(String),

    /// The underlying system reported an error
    #[error("system error: {0}")]
    System(String),
}

/// Discriminant of an [`Error`], for callers that match on kind alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotOpened,
    Invalid,
    NoPermission,
    NoRecord,
    Logic,
    Broken,
    System,
}

impl Error {
    /// Returns the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotOpened(_) => ErrorKind::NotOpened,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::NoPermission(_) => ErrorKind::NoPermission,
            Error::NoRecord(_) => ErrorKind::NoRecord,
            Error::Logic(_) => ErrorKind::Logic,
            Error::Broken(_) => ErrorKind::Broken,
            Error::System(_) => ErrorKind::System,
        }
    }

    /// Whether this error marks the database image as unreliable
    ///
    /// Fatal errors set a sticky flag in the file header; the next
    /// writer open triggers a rebuild unless repair was disabled.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Broken(_) | Error::System(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::System(e.to_string())
    }
}
