//! Error taxonomy shared by every component (§7).
//!
//! Chunker and VectorStore surface these verbatim. Indexer recovers
//! `Upstream` with backoff and surfaces anything else. ToolDispatcher never
//! lets a handler error escape a call — every error becomes the `error`
//! field of a `ToolResult` instead of propagating.

use thiserror::Error;

/// Stable error kind, exposed to callers so they can decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NotIndexed,
    Cancelled,
    Upstream,
    Conflict,
    Io,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("project not indexed: {0}")]
    NotIndexed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("upstream embedding provider error: {0}")]
    Upstream(String),

    #[error("embedding dimension conflict: expected {expected}, got {actual}")]
    Conflict { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotIndexed(_) => ErrorKind::NotIndexed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Io(_) => ErrorKind::Io,
            Error::Database(_) => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when an Indexer batch failure should be retried with backoff
    /// rather than skipped immediately (§4.5 failure handling).
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Upstream)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
