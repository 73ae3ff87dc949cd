use std::path::PathBuf;

use thiserror::Error;

/// Failures of the staging area's directory and marker operations.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to create staging directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write marker {}: {source}", path.display())]
    Marker {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to scan staging directory {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors that abort a migration before or after the worker pool runs.
///
/// Per-asset and per-album failures never surface here; they are counted.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Pusher pool size must be at least 1")]
    NoPushers,
}
