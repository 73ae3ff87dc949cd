//! Repository backed by a plain directory tree.
//!
//! Media files directly under the root are assets without an album; each
//! first-level subdirectory is an album. Asset ids are content hashes, so the
//! same photo filed under two album folders is one asset with two memberships.
//!
//! An album directory holding a `.shared` file is a shared album. If the file
//! reads `restricted`, its assets may be listed but not pulled.

use std::collections::HashMap;
use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{
    AssetRepository, PushOutcome, RemoteAlbum, RemoteAsset, RepositoryError, SharedAccess,
};
use crate::paths::{album_dir_name, clean_filename, is_hidden, short_id, unique_path};
use crate::types::AssetKind;

const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "gif", "webp", "tif", "tiff", "bmp", "dng", "raw",
    "cr2", "nef", "arw",
];

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "3gp", "mts", "webm"];

const SHARED_MARKER: &str = ".shared";

fn shared_access(dir: &Path) -> Option<SharedAccess> {
    let marker = std::fs::read_to_string(dir.join(SHARED_MARKER)).ok()?;
    if marker.trim().eq_ignore_ascii_case("restricted") {
        Some(SharedAccess::Restricted)
    } else {
        Some(SharedAccess::Full)
    }
}

/// Classify a file as photo or video by extension; `None` for non-media.
pub fn media_kind(path: &Path) -> Option<AssetKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(AssetKind::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(AssetKind::Video)
    } else {
        None
    }
}

/// Hex of the first 16 bytes of the file's SHA-256.
fn content_id(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let hash = hasher.finalize();
    Ok(hash[..16].iter().map(|b| format!("{:02x}", b)).collect())
}

fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

/// Known locations of every asset in the library, keyed by content id.
#[derive(Debug, Default)]
struct ContentIndex {
    by_id: HashMap<String, Vec<PathBuf>>,
}

impl ContentIndex {
    fn insert(&mut self, id: &str, path: PathBuf) {
        let paths = self.by_id.entry(id.to_string()).or_default();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Paths for `id` that still exist on disk.
    fn live_paths(&self, id: &str) -> Vec<PathBuf> {
        self.by_id
            .get(id)
            .map(|paths| paths.iter().filter(|p| p.exists()).cloned().collect())
            .unwrap_or_default()
    }

    fn replace(&mut self, id: &str, old: &Path, new: PathBuf) {
        if let Some(paths) = self.by_id.get_mut(id) {
            paths.retain(|p| p != old);
        }
        self.insert(id, new);
    }
}

struct FolderLibrary {
    name: String,
    root: PathBuf,
    /// Built on first use; every mutation of the tree goes through it.
    index: Mutex<Option<ContentIndex>>,
}

impl FolderLibrary {
    fn media_files(dir: &Path) -> Result<Vec<PathBuf>, RepositoryError> {
        let entries = std::fs::read_dir(dir).map_err(|e| RepositoryError::io(dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| RepositoryError::io(dir, e))?.path();
            if path.is_file() && !is_hidden(&path) && media_kind(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn album_dirs(&self) -> Result<Vec<PathBuf>, RepositoryError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| RepositoryError::io(&self.root, e))?;
        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| RepositoryError::io(&self.root, e))?.path();
            if path.is_dir() && !is_hidden(&path) {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Resolve an album id to its directory, rejecting anything that isn't a
    /// plain first-level directory name.
    fn album_dir(&self, album_id: &str) -> Result<PathBuf, RepositoryError> {
        let invalid = album_id.is_empty()
            || album_id.starts_with('.')
            || album_id.contains(['/', '\\']);
        let dir = self.root.join(album_id);
        if invalid || !dir.is_dir() {
            return Err(RepositoryError::AlbumNotFound(album_id.to_string()));
        }
        Ok(dir)
    }

    fn describe(path: &Path) -> Result<RemoteAsset, RepositoryError> {
        let kind = media_kind(path).ok_or_else(|| RepositoryError::UnsupportedMedia(path.into()))?;
        let meta = std::fs::metadata(path).map_err(|e| RepositoryError::io(path, e))?;
        let modified = meta.modified().map_err(|e| RepositoryError::io(path, e))?;
        Ok(RemoteAsset {
            id: content_id(path).map_err(|e| RepositoryError::io(path, e))?,
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            time: DateTime::<Utc>::from(modified),
            kind,
        })
    }

    fn build_index(&self) -> Result<ContentIndex, RepositoryError> {
        let mut index = ContentIndex::default();
        let mut files = Self::media_files(&self.root)?;
        for dir in self.album_dirs()? {
            files.extend(Self::media_files(&dir)?);
        }
        for path in files {
            let id = content_id(&path).map_err(|e| RepositoryError::io(&path, e))?;
            index.insert(&id, path);
        }
        tracing::debug!(
            library = %self.name,
            assets = index.by_id.len(),
            "Built content index"
        );
        Ok(index)
    }

    fn with_index<T>(
        &self,
        f: impl FnOnce(&mut ContentIndex) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut guard = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.build_index()?);
        }
        match guard.as_mut() {
            Some(index) => f(index),
            None => Err(RepositoryError::Other(anyhow::anyhow!("content index unavailable"))),
        }
    }

    fn list_albums(&self, include_shared: bool) -> Result<Vec<RemoteAlbum>, RepositoryError> {
        let mut albums = Vec::new();
        for dir in self.album_dirs()? {
            let shared = shared_access(&dir);
            if shared.is_some() && !include_shared {
                continue;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            albums.push(RemoteAlbum {
                id: name.clone(),
                name,
                asset_count: Self::media_files(&dir)?.len() as u64,
                shared,
            });
        }
        Ok(albums)
    }

    fn list_album_assets(&self, album_id: &str) -> Result<Vec<RemoteAsset>, RepositoryError> {
        let dir = self.album_dir(album_id)?;
        Self::media_files(&dir)?
            .iter()
            .map(|p| Self::describe(p))
            .collect()
    }

    fn list_unassociated_assets(&self) -> Result<Vec<RemoteAsset>, RepositoryError> {
        Self::media_files(&self.root)?
            .iter()
            .map(|p| Self::describe(p))
            .collect()
    }

    fn pull(
        &self,
        asset_id: &str,
        filename: &str,
        time: DateTime<Utc>,
        dest_dir: &Path,
    ) -> Result<(), RepositoryError> {
        let paths = self.with_index(|index| Ok(index.live_paths(asset_id)))?;
        if paths.is_empty() {
            return Err(RepositoryError::AssetNotFound(asset_id.to_string()));
        }
        let source = paths
            .into_iter()
            .find(|p| {
                p.parent().and_then(shared_access) != Some(SharedAccess::Restricted)
            })
            .ok_or_else(|| {
                RepositoryError::Rejected(format!("{} is only in restricted shared albums", asset_id))
            })?;
        let dest = dest_dir.join(filename);
        std::fs::copy(&source, &dest).map_err(|e| RepositoryError::io(&dest, e))?;
        if let Err(e) = set_file_mtime(&dest, time.timestamp()) {
            tracing::warn!("Could not set mtime on {}: {}", dest.display(), e);
        }
        Ok(())
    }

    fn push(&self, local_path: &Path) -> Result<PushOutcome, RepositoryError> {
        if media_kind(local_path).is_none() {
            return Err(RepositoryError::UnsupportedMedia(local_path.into()));
        }
        let id = content_id(local_path).map_err(|e| RepositoryError::io(local_path, e))?;
        let filename = local_path
            .file_name()
            .map(|n| clean_filename(&n.to_string_lossy()))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RepositoryError::UnsupportedMedia(local_path.into()))?;
        let modified = std::fs::metadata(local_path)
            .and_then(|m| m.modified())
            .map_err(|e| RepositoryError::io(local_path, e))?;

        // Check and copy under the index lock so two concurrent uploads of the
        // same content can't both land as new assets.
        self.with_index(|index| {
            if !index.live_paths(&id).is_empty() {
                return Ok(PushOutcome {
                    remote_id: id.clone(),
                    is_duplicate: true,
                });
            }
            let dest = unique_path(&self.root, &filename, short_id(&id));
            std::fs::copy(local_path, &dest).map_err(|e| RepositoryError::io(&dest, e))?;
            let ts = DateTime::<Utc>::from(modified).timestamp();
            if let Err(e) = set_file_mtime(&dest, ts) {
                tracing::warn!("Could not set mtime on {}: {}", dest.display(), e);
            }
            index.insert(&id, dest);
            Ok(PushOutcome {
                remote_id: id.clone(),
                is_duplicate: false,
            })
        })
    }

    fn album_exists(&self, name: &str) -> Option<String> {
        let dir_name = album_dir_name(name);
        self.root.join(&dir_name).is_dir().then_some(dir_name)
    }

    fn create_album(&self, name: &str) -> Result<String, RepositoryError> {
        let dir_name = album_dir_name(name);
        let dir = self.root.join(&dir_name);
        std::fs::create_dir_all(&dir).map_err(|e| RepositoryError::io(&dir, e))?;
        Ok(dir_name)
    }

    fn add_assets_to_album(
        &self,
        album_id: &str,
        asset_ids: &[String],
    ) -> Result<usize, RepositoryError> {
        let dir = self.album_dir(album_id)?;
        self.with_index(|index| {
            let mut added = 0;
            for id in asset_ids {
                let paths = index.live_paths(id);
                let Some(first) = paths.first().cloned() else {
                    return Err(RepositoryError::AssetNotFound(id.clone()));
                };
                if paths.iter().any(|p| p.parent() == Some(dir.as_path())) {
                    continue;
                }
                let filename = first
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| id.clone());
                let dest = unique_path(&dir, &filename, short_id(id));
                // A loose file moves into its first album; later albums get copies.
                let loose = paths
                    .iter()
                    .find(|p| p.parent() == Some(self.root.as_path()))
                    .cloned();
                match loose {
                    Some(loose) => {
                        std::fs::rename(&loose, &dest).map_err(|e| RepositoryError::io(&dest, e))?;
                        index.replace(id, &loose, dest);
                    }
                    None => {
                        std::fs::copy(&first, &dest).map_err(|e| RepositoryError::io(&dest, e))?;
                        index.insert(id, dest);
                    }
                }
                added += 1;
            }
            Ok(added)
        })
    }

    fn remove_assets(&self, asset_ids: &[String]) -> Result<usize, RepositoryError> {
        self.with_index(|index| {
            let mut removed = 0;
            for id in asset_ids {
                let Some(paths) = index.by_id.remove(id) else {
                    continue;
                };
                for path in &paths {
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(RepositoryError::io(path, e)),
                    }
                }
                removed += 1;
            }
            Ok(removed)
        })
    }
}

/// Filesystem-backed [`AssetRepository`].
pub struct FolderRepository {
    inner: Arc<FolderLibrary>,
}

impl std::fmt::Debug for FolderRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderRepository")
            .field("name", &self.inner.name)
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}

impl FolderRepository {
    /// Open an existing library directory.
    pub fn open(name: impl Into<String>, root: &Path) -> Result<Self, RepositoryError> {
        if !root.is_dir() {
            return Err(RepositoryError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "library directory not found"),
            ));
        }
        Ok(Self {
            inner: Arc::new(FolderLibrary {
                name: name.into(),
                root: root.to_path_buf(),
                index: Mutex::new(None),
            }),
        })
    }

    /// Open a library directory, creating it first if needed.
    pub fn create(name: impl Into<String>, root: &Path) -> Result<Self, RepositoryError> {
        std::fs::create_dir_all(root).map_err(|e| RepositoryError::io(root, e))?;
        Self::open(name, root)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Run a synchronous library operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&FolderLibrary) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let library = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&library))
            .await
            .map_err(|e| RepositoryError::Other(anyhow::anyhow!("Blocking task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl AssetRepository for FolderRepository {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_albums(&self, include_shared: bool) -> Result<Vec<RemoteAlbum>, RepositoryError> {
        self.blocking(move |lib| lib.list_albums(include_shared)).await
    }

    async fn list_album_assets(&self, album_id: &str) -> Result<Vec<RemoteAsset>, RepositoryError> {
        let album_id = album_id.to_string();
        self.blocking(move |lib| lib.list_album_assets(&album_id)).await
    }

    async fn list_unassociated_assets(&self) -> Result<Vec<RemoteAsset>, RepositoryError> {
        self.blocking(|lib| lib.list_unassociated_assets()).await
    }

    async fn pull(
        &self,
        asset_id: &str,
        filename: &str,
        time: DateTime<Utc>,
        dest_dir: &Path,
    ) -> Result<(), RepositoryError> {
        let asset_id = asset_id.to_string();
        let filename = filename.to_string();
        let dest_dir = dest_dir.to_path_buf();
        self.blocking(move |lib| lib.pull(&asset_id, &filename, time, &dest_dir))
            .await
    }

    async fn push(&self, local_path: &Path) -> Result<PushOutcome, RepositoryError> {
        let local_path = local_path.to_path_buf();
        self.blocking(move |lib| lib.push(&local_path)).await
    }

    async fn album_exists(&self, name: &str) -> Result<Option<String>, RepositoryError> {
        let name = name.to_string();
        self.blocking(move |lib| Ok(lib.album_exists(&name))).await
    }

    async fn create_album(&self, name: &str) -> Result<String, RepositoryError> {
        let name = name.to_string();
        self.blocking(move |lib| lib.create_album(&name)).await
    }

    async fn add_assets_to_album(
        &self,
        album_id: &str,
        asset_ids: &[String],
    ) -> Result<usize, RepositoryError> {
        let album_id = album_id.to_string();
        let asset_ids = asset_ids.to_vec();
        self.blocking(move |lib| lib.add_assets_to_album(&album_id, &asset_ids))
            .await
    }

    async fn remove_assets(&self, asset_ids: &[String]) -> Result<usize, RepositoryError> {
        let asset_ids = asset_ids.to_vec();
        self.blocking(move |lib| lib.remove_assets(&asset_ids)).await
    }
}
