use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout this crate's public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong operating on a [`crate::Table`].
///
/// Every fallible operation returns one of these three kinds; there is no exceptional
/// control flow that crosses the API boundary. [`Error::NotFound`] is only ever
/// produced by `get`/`del` misses, never by anything internal to the index or the
/// allocator (out-of-memory there is treated as fatal to the process, matching the
/// core's failure-mode contract).
#[derive(Debug, Error)]
pub enum Error {
    /// A filesystem or memory-map operation failed: a missing directory when creation
    /// is disallowed, a permission error, a segment too large to load, a read or write
    /// failure, or a failed remove of a stale segment.
    #[error("io error at {path}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    /// `get` or `del` found no entry for the given key.
    #[error("key not found")]
    NotFound,

    /// API misuse: operating on a closed table, double-open, double-close, a `put`
    /// whose on-disk record would exceed `max_file_size`, or a duplicate key observed
    /// across segment files while loading.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}
