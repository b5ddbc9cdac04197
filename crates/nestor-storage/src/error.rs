//! Error taxonomy for the partition, index, storage and consumer layers.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced at the boundary of this crate.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Magic mismatch, torn tail record, non-numeric length prefix,
    /// unparseable document, or an HMAC mismatch on an index header.
    #[error("corrupt file at {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// `readFrom(pos, expectedSize)` where the expected and actual frame
    /// sizes disagree — signals caller-side bug or index/log drift.
    #[error("expected frame of {expected} bytes at offset {offset}, found {actual}")]
    InvalidDataSize {
        offset: u32,
        expected: u32,
        actual: u32,
    },

    /// Another writer already owns the exclusive lock for this storage.
    #[error("storage at {path} is locked by another writer")]
    StorageLocked { path: PathBuf },

    /// Invalid range bounds passed to `readRange` / `Index::range`. Raised
    /// on first advance of the returned sequence, not at the call site.
    #[error("invalid range [{from}, {until}] against length {length}")]
    Range {
        from: i64,
        until: i64,
        length: u32,
    },

    /// An operation requiring an open partition, index or storage was
    /// attempted while it was closed.
    #[error("{what} is not open")]
    NotOpen { what: &'static str },

    /// `Consumer::set_state` was called from outside a document-handling
    /// callback.
    #[error("set_state called outside of a document handler")]
    StateMutation,

    /// An index file's stored matcher metadata is present but its HMAC
    /// could not be validated against the caller's secret — a narrower
    /// case of `CorruptFile` callers frequently want to match on
    /// specifically.
    #[error("HMAC validation failed for index at {path}")]
    HmacMismatch { path: PathBuf },

    /// The caller supplied a matcher to `ensureIndex` that does not agree
    /// with the matcher already persisted in the index's header.
    #[error("matcher supplied for index {name:?} does not match its stored metadata")]
    MatcherMismatch { name: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
