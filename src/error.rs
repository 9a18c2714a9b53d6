//! Error types for the reporting pipeline.

use thiserror::Error;

/// Errors surfaced by [`crate::database::Database`] implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Expected absence. Callers convert to an empty result or skip.
    #[error("not found")]
    NotFound,

    /// Backend indices are missing or could not be created.
    #[error("index not found")]
    IndexNotFound,

    /// Search pagination would exceed the backend window.
    #[error("pagination limit exceeded")]
    PaginationLimitExceeded,

    /// Upstream backend I/O or bulk-item failure. Safe to retry.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Malformed input that will not succeed on retry.
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend cannot be initialised. Aborts the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DatabaseError {
    /// Returns `true` if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors produced while decoding a Solidity storage layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown type reference '{0}' in storage layout")]
    UnknownType(String),

    #[error("malformed storage layout: {0}")]
    MalformedLayout(String),

    #[error("cannot parse array size from type name '{0}'")]
    BadArraySize(String),
}
