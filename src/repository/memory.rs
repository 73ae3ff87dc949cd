//! In-memory repository with fault injection, used by engine tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};

use super::{
    AssetRepository, PushOutcome, RemoteAlbum, RemoteAsset, RepositoryError, SharedAccess,
};
use crate::types::AssetKind;

#[derive(Debug, Clone)]
struct StoredAsset {
    filename: String,
    time: DateTime<Utc>,
    kind: AssetKind,
    content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredAlbum {
    id: String,
    name: String,
    shared: Option<SharedAccess>,
    asset_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    assets: HashMap<String, StoredAsset>,
    albums: Vec<StoredAlbum>,
    next_id: u64,
    pulls: usize,
    pushes: usize,
    albums_created: usize,
}

impl MemoryState {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    fn associated(&self) -> HashSet<&str> {
        self.albums
            .iter()
            .flat_map(|a| a.asset_ids.iter().map(String::as_str))
            .collect()
    }

    fn to_remote(&self, id: &str) -> Option<RemoteAsset> {
        self.assets.get(id).map(|a| RemoteAsset {
            id: id.to_string(),
            filename: a.filename.clone(),
            time: a.time,
            kind: a.kind,
        })
    }
}

/// Repository double. Asset content is the filename bytes unless given.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    name: String,
    state: Mutex<MemoryState>,
    fail_push: HashSet<String>,
    fail_pull: HashSet<String>,
    fail_listing: HashSet<String>,
    fail_association: bool,
    panic_push: HashSet<String>,
    panic_pull: HashSet<String>,
    panic_listing: HashSet<String>,
    clobber_staged: HashSet<String>,
}

pub fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

impl MemoryRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or reuse) an asset with the given id.
    pub fn with_asset(self, id: &str, filename: &str, kind: AssetKind) -> Self {
        self.state().assets.entry(id.to_string()).or_insert(StoredAsset {
            filename: filename.to_string(),
            time: test_time(),
            kind,
            content: format!("{}:{}", id, filename).into_bytes(),
        });
        self
    }

    pub fn with_album(self, name: &str, assets: &[(&str, &str, AssetKind)]) -> Self {
        self.with_album_shared(name, None, assets)
    }

    pub fn with_album_shared(
        mut self,
        name: &str,
        shared: Option<SharedAccess>,
        assets: &[(&str, &str, AssetKind)],
    ) -> Self {
        for (id, filename, kind) in assets {
            self = self.with_asset(id, filename, *kind);
        }
        {
            let mut state = self.state();
            let album_id = state.fresh_id("album-");
            state.albums.push(StoredAlbum {
                id: album_id,
                name: name.to_string(),
                shared,
                asset_ids: assets.iter().map(|(id, _, _)| id.to_string()).collect(),
            });
        }
        self
    }

    pub fn fail_push_for(mut self, filename: &str) -> Self {
        self.fail_push.insert(filename.to_string());
        self
    }

    pub fn panic_push_for(mut self, filename: &str) -> Self {
        self.panic_push.insert(filename.to_string());
        self
    }

    pub fn panic_pull_for(mut self, asset_id: &str) -> Self {
        self.panic_pull.insert(asset_id.to_string());
        self
    }

    pub fn panic_listing_for(mut self, album_name: &str) -> Self {
        self.panic_listing.insert(album_name.to_string());
        self
    }

    /// Swap the pushed file for a directory so its cleanup fails.
    pub fn clobber_staged_on_push_for(mut self, filename: &str) -> Self {
        self.clobber_staged.insert(filename.to_string());
        self
    }

    pub fn fail_pull_for(mut self, asset_id: &str) -> Self {
        self.fail_pull.insert(asset_id.to_string());
        self
    }

    pub fn fail_listing_for(mut self, album_name: &str) -> Self {
        self.fail_listing.insert(album_name.to_string());
        self
    }

    pub fn fail_album_association(mut self) -> Self {
        self.fail_association = true;
        self
    }

    pub fn asset_count(&self) -> usize {
        self.state().assets.len()
    }

    pub fn has_asset(&self, id: &str) -> bool {
        self.state().assets.contains_key(id)
    }

    /// Number of albums carrying this name (more than one means a create race).
    pub fn albums_named(&self, name: &str) -> usize {
        self.state().albums.iter().filter(|a| a.name == name).count()
    }

    pub fn album_asset_count(&self, name: &str) -> usize {
        self.state()
            .albums
            .iter()
            .filter(|a| a.name == name)
            .map(|a| a.asset_ids.len())
            .sum()
    }

    pub fn pull_calls(&self) -> usize {
        self.state().pulls
    }

    pub fn push_calls(&self) -> usize {
        self.state().pushes
    }

    pub fn albums_created(&self) -> usize {
        self.state().albums_created
    }
}

#[async_trait::async_trait]
impl AssetRepository for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_albums(&self, include_shared: bool) -> Result<Vec<RemoteAlbum>, RepositoryError> {
        let state = self.state();
        Ok(state
            .albums
            .iter()
            .filter(|a| include_shared || a.shared.is_none())
            .map(|a| RemoteAlbum {
                id: a.id.clone(),
                name: a.name.clone(),
                asset_count: a.asset_ids.len() as u64,
                shared: a.shared,
            })
            .collect())
    }

    async fn list_album_assets(&self, album_id: &str) -> Result<Vec<RemoteAsset>, RepositoryError> {
        let crashing = self
            .state()
            .albums
            .iter()
            .any(|a| a.id == album_id && self.panic_listing.contains(&a.name));
        if crashing {
            panic!("simulated crash listing {}", album_id);
        }
        let state = self.state();
        let album = state
            .albums
            .iter()
            .find(|a| a.id == album_id)
            .ok_or_else(|| RepositoryError::AlbumNotFound(album_id.to_string()))?;
        if self.fail_listing.contains(&album.name) {
            return Err(RepositoryError::Rejected(format!("listing {} failed", album.name)));
        }
        Ok(album
            .asset_ids
            .iter()
            .filter_map(|id| state.to_remote(id))
            .collect())
    }

    async fn list_unassociated_assets(&self) -> Result<Vec<RemoteAsset>, RepositoryError> {
        let state = self.state();
        let associated = state.associated();
        let mut ids: Vec<&String> = state
            .assets
            .keys()
            .filter(|id| !associated.contains(id.as_str()))
            .collect();
        ids.sort();
        Ok(ids.into_iter().filter_map(|id| state.to_remote(id)).collect())
    }

    async fn pull(
        &self,
        asset_id: &str,
        filename: &str,
        _time: DateTime<Utc>,
        dest_dir: &Path,
    ) -> Result<(), RepositoryError> {
        if self.panic_pull.contains(asset_id) {
            panic!("simulated crash pulling {}", asset_id);
        }
        let content = {
            let mut state = self.state();
            state.pulls += 1;
            if self.fail_pull.contains(asset_id) {
                return Err(RepositoryError::Rejected(format!("pull of {} failed", asset_id)));
            }
            state
                .assets
                .get(asset_id)
                .map(|a| a.content.clone())
                .ok_or_else(|| RepositoryError::AssetNotFound(asset_id.to_string()))?
        };
        let dest = dest_dir.join(filename);
        tokio::fs::write(&dest, content)
            .await
            .map_err(|e| RepositoryError::io(&dest, e))
    }

    async fn push(&self, local_path: &Path) -> Result<PushOutcome, RepositoryError> {
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.panic_push.contains(&filename) {
            panic!("simulated crash pushing {}", filename);
        }
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| RepositoryError::io(local_path, e))?;
        if self.clobber_staged.contains(&filename) {
            tokio::fs::remove_file(local_path)
                .await
                .map_err(|e| RepositoryError::io(local_path, e))?;
            tokio::fs::create_dir(local_path)
                .await
                .map_err(|e| RepositoryError::io(local_path, e))?;
        }
        let mut state = self.state();
        state.pushes += 1;
        if self.fail_push.contains(&filename) {
            return Err(RepositoryError::Rejected(format!("push of {} failed", filename)));
        }
        if let Some((id, _)) = state.assets.iter().find(|(_, a)| a.content == content) {
            return Ok(PushOutcome {
                remote_id: id.clone(),
                is_duplicate: true,
            });
        }
        let id = state.fresh_id("remote-");
        let kind = crate::repository::folder::media_kind(local_path).unwrap_or(AssetKind::Photo);
        state.assets.insert(
            id.clone(),
            StoredAsset {
                filename,
                time: test_time(),
                kind,
                content,
            },
        );
        Ok(PushOutcome {
            remote_id: id,
            is_duplicate: false,
        })
    }

    async fn album_exists(&self, name: &str) -> Result<Option<String>, RepositoryError> {
        // Widen the check-then-create window so races surface in tests.
        tokio::task::yield_now().await;
        Ok(self
            .state()
            .albums
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.id.clone()))
    }

    async fn create_album(&self, name: &str) -> Result<String, RepositoryError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let id = state.fresh_id("album-");
        state.albums_created += 1;
        state.albums.push(StoredAlbum {
            id: id.clone(),
            name: name.to_string(),
            shared: None,
            asset_ids: Vec::new(),
        });
        Ok(id)
    }

    async fn add_assets_to_album(
        &self,
        album_id: &str,
        asset_ids: &[String],
    ) -> Result<usize, RepositoryError> {
        if self.fail_association {
            return Err(RepositoryError::Rejected("association failed".into()));
        }
        let mut state = self.state();
        let album = state
            .albums
            .iter_mut()
            .find(|a| a.id == album_id)
            .ok_or_else(|| RepositoryError::AlbumNotFound(album_id.to_string()))?;
        let mut added = 0;
        for id in asset_ids {
            if !album.asset_ids.contains(id) {
                album.asset_ids.push(id.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn remove_assets(&self, asset_ids: &[String]) -> Result<usize, RepositoryError> {
        let mut state = self.state();
        let mut removed = 0;
        for id in asset_ids {
            if state.assets.remove(id).is_some() {
                removed += 1;
            }
            for album in &mut state.albums {
                album.asset_ids.retain(|a| a != id);
            }
        }
        Ok(removed)
    }
}
