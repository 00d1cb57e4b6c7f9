//! Storage read boundary.
//!
//! Discovery only needs three things from object storage: a filtered listing
//! with `(path, modification_time, length)` per entry, a fresh stat, and the
//! raw bytes on demand. Backends implement [`ObjectStore`]; the crate ships a
//! local-filesystem volume.

pub mod glob_filter;
pub mod local;
pub mod watch;

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DeadLetterKind;

pub use glob_filter::PathGlobFilter;
pub use local::LocalVolume;
pub use watch::{watch_prefix, PrefixWatcher};

/// Errors from the storage boundary
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid data at {path}: {message}")]
    InvalidData { path: String, message: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error at {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid glob pattern '{pattern}'")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Classify an IO error raised while touching `path`
    pub fn from_io(path: impl Into<String>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            io::ErrorKind::InvalidData
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::NotADirectory => Self::InvalidData {
                path,
                message: err.to_string(),
            },
            _ => Self::Io { path, source: err },
        }
    }

    /// Transient errors are retried and never mark a file discovered.
    ///
    /// Unclassified IO errors count as transient; only failures that will not
    /// change on retry end up in the dead-letter table.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io { .. } => true,
            Self::NotFound(_)
            | Self::PermissionDenied(_)
            | Self::InvalidData { .. }
            | Self::Pattern { .. } => false,
        }
    }

    /// The error and its sources on one line, for dead-letter records
    pub fn describe(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }

    /// Dead-letter category for a permanent failure
    pub fn dead_letter_kind(&self) -> DeadLetterKind {
        match self {
            Self::NotFound(_) => DeadLetterKind::NotFound,
            Self::PermissionDenied(_) => DeadLetterKind::PermissionDenied,
            Self::InvalidData { .. } => DeadLetterKind::InvalidData,
            _ => DeadLetterKind::Other,
        }
    }
}

/// A listed storage entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Full storage path
    pub path: String,

    /// Provider modification token
    pub modification_time: DateTime<Utc>,

    /// Length in bytes
    pub length: u64,
}

/// Object storage as seen by discovery
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// List files under `prefix` (recursively) whose name matches `filter`
    async fn list(&self, prefix: &str, filter: &PathGlobFilter) -> StorageResult<Vec<FileEntry>>;

    /// Re-read metadata for a single file
    async fn stat(&self, path: &str) -> StorageResult<FileEntry>;

    /// Read the full payload of a file
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let not_found = StorageError::from_io("/a", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(not_found, StorageError::NotFound(_)));
        assert!(!not_found.is_transient());
        assert_eq!(not_found.dead_letter_kind(), DeadLetterKind::NotFound);

        let denied =
            StorageError::from_io("/a", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());
        assert_eq!(denied.dead_letter_kind(), DeadLetterKind::PermissionDenied);

        let timed_out = StorageError::from_io("/a", io::Error::from(io::ErrorKind::TimedOut));
        assert!(timed_out.is_transient());

        assert!(StorageError::Unavailable("volume offline".into()).is_transient());
    }

    #[test]
    fn test_wrong_entry_type_is_permanent() {
        for kind in [io::ErrorKind::IsADirectory, io::ErrorKind::NotADirectory] {
            let err = StorageError::from_io("/a.wav", io::Error::from(kind));
            assert!(!err.is_transient());
            assert_eq!(err.dead_letter_kind(), DeadLetterKind::InvalidData);
        }
    }

    #[test]
    fn test_describe_includes_source_once() {
        let cause = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let err = StorageError::from_io("/a.wav", cause);
        assert_eq!(err.to_string(), "IO error at /a.wav");
        assert_eq!(err.describe(), "IO error at /a.wav: disk on fire");
    }
}
