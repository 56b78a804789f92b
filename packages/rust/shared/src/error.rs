//! Error types for tedsync.
//!
//! Library crates use [`TedSyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all tedsync operations.
#[derive(Debug, thiserror::Error)]
pub enum TedSyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error (downloads, calendar fetch, bulk requests).
    #[error("transport error: {0}")]
    Transport(String),

    /// Neither supported container format could open the archive.
    #[error("unsupported archive format: {path:?}")]
    UnsupportedFormat { path: PathBuf },

    /// The archive matched a known format but failed to unpack.
    #[error("corrupt archive {path:?}: {message}")]
    CorruptArchive { path: PathBuf, message: String },

    /// Unparseable markup or calendar content.
    #[error("format error: {message}")]
    Format { message: String },

    /// Index creation or settings update failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// The bulk response reported per-item failures.
    #[error("partial index failure: {failed} of {attempted} documents rejected")]
    PartialIndex { attempted: usize, failed: usize },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad id, empty package, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TedSyncError>;

impl TedSyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a format error from any displayable message.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
