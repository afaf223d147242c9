//! Protocol error taxonomy.
//!
//! Every error that crosses the file-operation boundary becomes one of these
//! variants; the transport renders them as Rerror strings. Recoverable
//! failures (bad user code, sandbox rejections) are deliberately NOT here —
//! they surface as readable content in `STDERR` or the terminal's `stdout`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// Write to a read-only file, or read of a write-only one.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Malformed ctl command, malformed routes line, unknown version command.
    #[error("usage: {0}")]
    Usage(String),

    /// Walk to a missing child, unknown fid, goto of an unknown version.
    #[error("{0} not found")]
    NotFound(String),

    /// PTY write failure, dead terminal reference, host filesystem errors.
    #[error("io error: {0}")]
    Io(String),

    /// `state` restore with bad JSON or an unknown envelope version.
    #[error("corrupt state: {0}")]
    CorruptState(String),
}

impl FsError {
    pub fn permission(what: impl Into<String>) -> Self {
        FsError::Permission(what.into())
    }

    pub fn usage(what: impl Into<String>) -> Self {
        FsError::Usage(what.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        FsError::NotFound(what.into())
    }

    pub fn io(what: impl Into<String>) -> Self {
        FsError::Io(what.into())
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

pub type FsResult<T> = Result<T, FsError>;
