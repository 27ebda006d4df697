//! Error types for the repository engine.
//!
//! Every failure surfaces as one structured enum so callers can branch on
//! the variant instead of parsing messages. We use `thiserror` for
//! ergonomic error definition.

use thiserror::Error;

use crate::revision::Revision;

/// The main error type for repository operations.
#[derive(Debug, Error)]
pub enum Error {
    /// revision normalization failed (unknown or out-of-range revision)
    #[error("revision not found: {0}")]
    RevisionNotFound(Revision),

    /// open was attempted on a directory that holds no repository
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// stale base revision, conflicting rename/remove, or a patch that
    /// does not apply cleanly
    #[error("change conflict: {reason}")]
    ChangeConflict { reason: String },

    /// the commit would not change anything and empty commits are not allowed
    #[error("redundant change: {reason}")]
    RedundantChange { reason: String },

    /// the operation was issued after close began
    #[error("repository is shutting down")]
    ShuttingDown,

    /// I/O failure or a broken storage invariant
    #[error("storage error: {0}")]
    Storage(String),

    /// the caller's deadline elapsed before the operation could start
    #[error("operation timed out before start: {operation}")]
    Timeout { operation: &'static str },
}

impl Error {
    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        Error::ChangeConflict { reason: reason.into() }
    }

    pub(crate) fn redundant(reason: impl Into<String>) -> Self {
        Error::RedundantChange { reason: reason.into() }
    }

    pub(crate) fn storage(reason: impl Into<String>) -> Self {
        Error::Storage(reason.into())
    }

    /// check if this error is a conflict the caller can resolve by
    /// rebasing its changes
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ChangeConflict { .. })
    }

    /// check if this error is recoverable by the caller
    ///
    /// `Storage` indicates a broken invariant or an I/O failure and is
    /// reported up unchanged; everything else carries enough context for
    /// the caller to retry or adjust.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Storage(_))
    }
}

impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        Error::Storage(format!("git: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("json: {e}"))
    }
}

/// result type alias for repository operations
pub type Result<T> = std::result::Result<T, Error>;
