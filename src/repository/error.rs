use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by an [`AssetRepository`](super::AssetRepository).
///
/// Repositories are expected to have already retried whatever they consider
/// transient; the pipeline treats every error as a per-call failure to be
/// counted and skipped.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Album not found: {0}")]
    AlbumNotFound(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Not a supported media file: {}", .0.display())]
    UnsupportedMedia(PathBuf),

    #[error("Rejected by repository: {0}")]
    Rejected(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RepositoryError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
