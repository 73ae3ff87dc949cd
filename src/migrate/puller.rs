//! The single producer: discovers albums and loose assets on the source,
//! stages each one locally and hands it to the work queue.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use super::queue::{Admission, AlbumLink, Membership, TransferItem};
use super::{panic_message, Pipeline};
use crate::paths::{candidate_names, short_id, staged_filename};
use crate::repository::{AssetRepository, RemoteAlbum, RemoteAsset};
use crate::types::AssetKind;

/// Discovery-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullFilter {
    pub include_shared: bool,
    pub skip_photos: bool,
    pub skip_videos: bool,
}

impl PullFilter {
    fn admits(&self, kind: AssetKind) -> bool {
        match kind {
            AssetKind::Photo => !self.skip_photos,
            AssetKind::Video => !self.skip_videos,
        }
    }
}

pub(super) struct Puller {
    source: Arc<dyn AssetRepository>,
    pipeline: Arc<Pipeline>,
    filter: PullFilter,
    shutdown: CancellationToken,
}

impl Puller {
    pub(super) fn new(
        source: Arc<dyn AssetRepository>,
        pipeline: Arc<Pipeline>,
        filter: PullFilter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            pipeline,
            filter,
            shutdown,
        }
    }

    /// Pull everything, albums first, then unassociated assets.
    pub(super) async fn run(self) {
        match self.source.list_albums(self.filter.include_shared).await {
            Ok(albums) => {
                tracing::info!("Found {} albums on {}", albums.len(), self.source.name());
                for album in &albums {
                    if self.shutdown.is_cancelled() {
                        tracing::info!("Shutdown requested, stopping album discovery");
                        return;
                    }
                    self.pull_album(album).await;
                }
            }
            Err(e) => {
                tracing::error!("Failed to list albums on {}: {}", self.source.name(), e);
                self.pipeline.counters.record_album_failed();
            }
        }

        if self.shutdown.is_cancelled() {
            return;
        }
        self.pull_unassociated().await;
    }

    async fn pull_album(&self, album: &RemoteAlbum) {
        let counters = &self.pipeline.counters;
        if album.is_blocked() {
            tracing::warn!(
                "Skipping shared album {:?}: assets can't be downloaded ({} assets)",
                album.name,
                album.asset_count
            );
            counters.record_blocked_album(album.asset_count);
            return;
        }

        let assets = match self.source.list_album_assets(&album.id).await {
            Ok(assets) => assets,
            Err(e) => {
                tracing::warn!("Failed to list album {:?}: {}", album.name, e);
                counters.record_album_failed();
                return;
            }
        };
        let assets = self.filtered(assets);
        self.pipeline
            .info
            .add_source_totals(1, assets.len() as u64);
        if assets.is_empty() {
            tracing::debug!("Album {:?} has nothing to transfer", album.name);
            return;
        }

        let staging = &self.pipeline.staging;
        let dir = match staging.begin_album(&album.name).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("Skipping album {:?}: {}", album.name, e);
                counters.record_album_failed();
                return;
            }
        };
        tracing::info!("Pulling album {:?} ({} assets)", album.name, assets.len());

        let mut staged = 0usize;
        for asset in &assets {
            if self.shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, leaving album {:?} incomplete", album.name);
                break;
            }
            if self.stage(asset, &dir, Some(&album.name)).await {
                staged += 1;
            }
        }

        if staged > 0 {
            // Count before dropping `.active` so a Pusher finalizing the album
            // always sees it as pulled.
            counters.record_pulled_album();
        }
        if let Err(e) = staging.clear_active(&dir).await {
            tracing::warn!("{}", e);
        }
        if staged > 0 {
            staging.try_finalize_album(&album.name, counters).await;
        } else {
            staging.remove_empty_dir(&dir).await;
        }
    }

    async fn pull_unassociated(&self) {
        let assets = match self.source.list_unassociated_assets().await {
            Ok(assets) => self.filtered(assets),
            Err(e) => {
                tracing::error!("Failed to list unassociated assets: {}", e);
                return;
            }
        };
        self.pipeline
            .info
            .add_source_totals(0, assets.len() as u64);
        if assets.is_empty() {
            return;
        }
        tracing::info!("Pulling {} unassociated assets", assets.len());

        let staging = &self.pipeline.staging;
        let root = staging.root().to_path_buf();
        if let Err(e) = staging.mark_active(&root).await {
            tracing::warn!("{}", e);
        }
        for asset in &assets {
            if self.shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, stopping unassociated pull");
                break;
            }
            self.stage(asset, &root, None).await;
        }
        if let Err(e) = staging.clear_active(&root).await {
            tracing::warn!("{}", e);
        }
    }

    fn filtered(&self, assets: Vec<RemoteAsset>) -> Vec<RemoteAsset> {
        assets
            .into_iter()
            .filter(|a| self.filter.admits(a.kind))
            .collect()
    }

    /// Stage one asset into `dir` and enqueue it. Returns whether a new
    /// transfer item was admitted.
    async fn stage(&self, asset: &RemoteAsset, dir: &Path, album: Option<&str>) -> bool {
        let counters = &self.pipeline.counters;
        let queue = &self.pipeline.queue;

        match queue.index().claim(&asset.id, album) {
            Membership::New => {}
            membership => {
                tracing::debug!("Asset {} already staged, recording membership only", asset.id);
                counters.record_pull_duplicate();
                if let (Membership::Pushed(remote_id), Some(album)) = (membership, album) {
                    queue
                        .enqueue_link(AlbumLink {
                            asset_id: asset.id.clone(),
                            remote_id,
                            album_name: album.to_string(),
                        })
                        .await;
                }
                return false;
            }
        }

        let (filename, staged_path) = self.free_path(dir, asset).await;
        if let Err(e) = self.download(asset, dir, &filename, &staged_path).await {
            tracing::warn!("Failed to pull {}: {:#}", asset.filename, e);
            counters.record_pull_failed(asset.kind);
            return false;
        }

        let item = TransferItem {
            asset_id: asset.id.clone(),
            staged_path: staged_path.clone(),
            asset_time: asset.time,
            kind: asset.kind,
            album_name: album.map(str::to_string),
        };
        match queue.enqueue_unique(item).await {
            Admission::Admitted => {
                counters.record_pulled(asset.kind);
                tracing::debug!("Staged {}", staged_path.display());
                true
            }
            Admission::Rejected => {
                counters.record_pull_duplicate();
                self.release_rejected(&staged_path).await;
                false
            }
        }
    }

    /// First name for `asset` in `dir` that is neither on disk nor already
    /// admitted to the queue.
    async fn free_path(&self, dir: &Path, asset: &RemoteAsset) -> (String, PathBuf) {
        let base = staged_filename(&asset.filename, &asset.id);
        for name in candidate_names(&base, short_id(&asset.id)) {
            let path = dir.join(&name);
            if self.pipeline.queue.index().contains_path(&path) {
                continue;
            }
            // Treat an unreadable entry as taken.
            if tokio::fs::try_exists(&path).await.unwrap_or(true) {
                continue;
            }
            return (name, path);
        }
        let path = dir.join(&base);
        (base, path)
    }

    /// Drop the staged copy of a rejected item unless a queued item still
    /// refers to the same path.
    async fn release_rejected(&self, staged_path: &Path) {
        if self.pipeline.queue.index().contains_path(staged_path) {
            return;
        }
        if let Err(e) = self.pipeline.staging.remove_staged(staged_path).await {
            tracing::warn!("{}", e);
        }
    }

    async fn download(
        &self,
        asset: &RemoteAsset,
        dir: &Path,
        filename: &str,
        staged_path: &Path,
    ) -> anyhow::Result<()> {
        let staging = &self.pipeline.staging;
        let marker = staging.lock(staged_path).await?;
        let result = AssertUnwindSafe(self.source.pull(&asset.id, filename, asset.time, dir))
            .catch_unwind()
            .await;
        staging.unlock(&marker).await?;
        let error = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => anyhow::Error::from(e),
            Err(panic) => anyhow::anyhow!("pull crashed: {}", panic_message(panic.as_ref())),
        };
        staging.remove_staged(staged_path).await?;
        Err(error)
    }
}
