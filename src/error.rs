//! Error types for merkledb

use thiserror::Error;

/// Result type alias for merkledb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in merkledb operations
///
/// Absence of a key or version is not an error; read paths surface it
/// through `Option`/`bool` returns instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Node missing from store: {0}")]
    NodeMissing(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid database file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl Error {
    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }
}
