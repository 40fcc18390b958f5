//! Error taxonomy for change propagation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while classifying notifications or confirming readiness.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another writer holds the file; waiting may help.
    #[error("file {} is locked by another writer: {source}", .path.display())]
    TransientLock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Readiness probe failed for a reason other than a lock.
    #[error("unexpected I/O failure while probing {}: {source}", .path.display())]
    UnexpectedIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gave up waiting for {} to become readable after {attempts} attempts", .path.display())]
    RetriesExhausted { path: PathBuf, attempts: u32 },

    #[error("readiness check for {} was cancelled", .path.display())]
    Cancelled { path: PathBuf },

    #[error("path {} is outside the watch root {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("path {} is not valid UTF-8", .path.display())]
    NonUtf8Path { path: PathBuf },

    #[error("move notification for {} carries no destination", .path.display())]
    MissingDestination { path: PathBuf },

    #[error("invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("no tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("invalid configuration in {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
}

impl SyncError {
    /// Whether retrying the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientLock { .. })
    }

    /// Path the error concerns, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            SyncError::TransientLock { path, .. }
            | SyncError::UnexpectedIo { path, .. }
            | SyncError::RetriesExhausted { path, .. }
            | SyncError::Cancelled { path }
            | SyncError::OutsideRoot { path, .. }
            | SyncError::NonUtf8Path { path }
            | SyncError::MissingDestination { path }
            | SyncError::Config { path, .. } => Some(path),
            SyncError::Pattern(_) | SyncError::Watch(_) | SyncError::Runtime(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
