//! Asset repository contract shared by the source and target roles.
//!
//! The migration engine only talks to repositories through [`AssetRepository`].
//! Backend clients are expected to be resilient on their own: a returned error
//! is final for that call, and the engine counts and skips it.

pub mod error;
pub mod folder;
#[cfg(test)]
pub mod memory;

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::types::AssetKind;

pub use error::RepositoryError;
pub use folder::FolderRepository;

/// Access level the current user has on a shared album.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedAccess {
    /// Assets can be listed and downloaded.
    Full,
    /// Album is visible but its assets cannot be downloaded.
    Restricted,
}

/// An album as listed by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAlbum {
    pub id: String,
    pub name: String,
    pub asset_count: u64,
    /// `None` for albums owned by the current user.
    pub shared: Option<SharedAccess>,
}

impl RemoteAlbum {
    /// Shared albums whose assets we are not permitted to download.
    pub fn is_blocked(&self) -> bool {
        self.shared == Some(SharedAccess::Restricted)
    }
}

/// An asset as listed by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAsset {
    pub id: String,
    pub filename: String,
    pub time: DateTime<Utc>,
    pub kind: AssetKind,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub remote_id: String,
    /// The repository already held this asset; `remote_id` refers to the
    /// existing copy.
    pub is_duplicate: bool,
}

/// Object-safe repository interface, shared across tasks as
/// `Arc<dyn AssetRepository>`.
#[async_trait::async_trait]
pub trait AssetRepository: Send + Sync {
    /// Human-readable name used in logs and run reports.
    fn name(&self) -> &str;

    async fn list_albums(&self, include_shared: bool) -> Result<Vec<RemoteAlbum>, RepositoryError>;

    async fn list_album_assets(&self, album_id: &str) -> Result<Vec<RemoteAsset>, RepositoryError>;

    /// Assets that belong to no album.
    async fn list_unassociated_assets(&self) -> Result<Vec<RemoteAsset>, RepositoryError>;

    /// Download an asset into `dest_dir/filename`, stamping it with `time`.
    async fn pull(
        &self,
        asset_id: &str,
        filename: &str,
        time: DateTime<Utc>,
        dest_dir: &Path,
    ) -> Result<(), RepositoryError>;

    /// Upload a local file.
    async fn push(&self, local_path: &Path) -> Result<PushOutcome, RepositoryError>;

    /// Look an album up by name, returning its id if it exists.
    async fn album_exists(&self, name: &str) -> Result<Option<String>, RepositoryError>;

    async fn create_album(&self, name: &str) -> Result<String, RepositoryError>;

    /// Returns the number of assets newly added.
    async fn add_assets_to_album(
        &self,
        album_id: &str,
        asset_ids: &[String],
    ) -> Result<usize, RepositoryError>;

    /// Returns the number of assets removed.
    async fn remove_assets(&self, asset_ids: &[String]) -> Result<usize, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album(shared: Option<SharedAccess>) -> RemoteAlbum {
        RemoteAlbum {
            id: "1".into(),
            name: "A".into(),
            asset_count: 0,
            shared,
        }
    }

    #[test]
    fn test_only_restricted_albums_are_blocked() {
        assert!(!album(None).is_blocked());
        assert!(!album(Some(SharedAccess::Full)).is_blocked());
        assert!(album(Some(SharedAccess::Restricted)).is_blocked());
    }
}
