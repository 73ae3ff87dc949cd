//! Pusher workers: drain the work queue, upload staged files and wire up
//! target album membership.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use futures_util::FutureExt;

use super::queue::{AlbumLink, QueueMessage, TransferItem};
use super::{panic_message, Pipeline};
use crate::repository::AssetRepository;

/// Target albums resolved during this run, keyed by name.
///
/// Each name gets its own async lock so that two Pushers meeting the same
/// new album don't both create it. Lookups for different names never
/// contend beyond the brief map access.
#[derive(Debug, Default)]
pub struct TargetAlbums {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<String>>>>>,
}

impl TargetAlbums {
    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<Option<String>>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.to_string()).or_default())
    }

    /// Id of the target album called `name`, creating it if needed.
    pub async fn resolve(
        &self,
        target: &dyn AssetRepository,
        name: &str,
    ) -> anyhow::Result<String> {
        let slot = self.slot(name);
        let mut cached = slot.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let id = match target
            .album_exists(name)
            .await
            .with_context(|| format!("Failed to look up album {:?}", name))?
        {
            Some(id) => id,
            None => {
                let id = target
                    .create_album(name)
                    .await
                    .with_context(|| format!("Failed to create album {:?}", name))?;
                tracing::info!("Created album {:?} on {}", name, target.name());
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }
}

/// Source assets deleted per `remove_assets` call in move mode.
const REMOVE_BATCH: usize = 100;

/// Context shared by all Pushers of a pool.
pub(super) struct PusherPool {
    source: Arc<dyn AssetRepository>,
    target: Arc<dyn AssetRepository>,
    pipeline: Arc<Pipeline>,
    albums: TargetAlbums,
    move_assets: bool,
    /// Source ids safely on the target, removed after the run in move mode.
    pushed: Mutex<Vec<String>>,
}

impl PusherPool {
    pub(super) fn new(
        source: Arc<dyn AssetRepository>,
        target: Arc<dyn AssetRepository>,
        pipeline: Arc<Pipeline>,
        move_assets: bool,
    ) -> Self {
        Self {
            source,
            target,
            pipeline,
            albums: TargetAlbums::default(),
            move_assets,
            pushed: Mutex::new(Vec::new()),
        }
    }

    /// Worker loop. Returns after consuming one termination signal.
    pub(super) async fn run_worker(self: Arc<Self>, id: usize) {
        let mut handled = 0usize;
        while let Some(message) = self.pipeline.queue.dequeue().await {
            let (label, in_flight) = match &message {
                QueueMessage::Terminate => break,
                QueueMessage::Transfer(item) => {
                    (item.staged_path.display().to_string(), Some(item.clone()))
                }
                QueueMessage::Link(link) => (format!("album link {:?}", link.album_name), None),
            };
            if let Err(panic) = AssertUnwindSafe(self.handle(message)).catch_unwind().await {
                tracing::error!(
                    "Pusher {} crashed on {}: {}",
                    id,
                    label,
                    panic_message(panic.as_ref())
                );
                match in_flight {
                    Some(item) => self.abandon(item).await,
                    None => self.pipeline.counters.record_association_failed(),
                }
            }
            handled += 1;
        }
        tracing::debug!("Pusher {} finished after {} messages", id, handled);
    }

    async fn handle(&self, message: QueueMessage) {
        match message {
            QueueMessage::Transfer(item) => self.transfer(item).await,
            QueueMessage::Link(link) => self.link(link).await,
            QueueMessage::Terminate => {}
        }
    }

    async fn transfer(&self, item: TransferItem) {
        let pipeline = &self.pipeline;
        let counters = &pipeline.counters;

        let pushed = self.target.push(&item.staged_path).await;
        let remote_id = match &pushed {
            Ok(outcome) if outcome.is_duplicate => {
                tracing::debug!("{} already on {}", item.staged_path.display(), self.target.name());
                counters.record_push_duplicate();
                Some(outcome.remote_id.as_str())
            }
            Ok(outcome) => {
                tracing::debug!("Pushed {}", item.staged_path.display());
                counters.record_pushed(item.kind);
                Some(outcome.remote_id.as_str())
            }
            Err(e) => {
                tracing::warn!("Failed to push {}: {}", item.staged_path.display(), e);
                counters.record_push_failed(item.kind);
                None
            }
        };
        let extra_albums = pipeline.queue.index().settle(&item.asset_id, remote_id);

        if remote_id.is_some() && self.move_assets {
            self.pushed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item.asset_id.clone());
        }

        self.release_staged(&item).await;

        if let Some(remote_id) = remote_id {
            for album in item.album_name.iter().chain(extra_albums.iter()) {
                self.associate(remote_id, album).await;
            }
        }

        if let Some(album) = &item.album_name {
            pipeline.staging.try_finalize_album(album, counters).await;
        }
    }

    /// Account for an item whose processing panicked and release its staged
    /// file so the album can still be finalized.
    async fn abandon(&self, item: TransferItem) {
        let pipeline = &self.pipeline;
        pipeline.counters.record_push_failed(item.kind);
        pipeline.queue.index().settle(&item.asset_id, None);
        self.release_staged(&item).await;
        if let Some(album) = &item.album_name {
            pipeline.staging.try_finalize_album(album, &pipeline.counters).await;
        }
    }

    async fn release_staged(&self, item: &TransferItem) {
        if let Err(e) = self.pipeline.staging.remove_staged(&item.staged_path).await {
            tracing::warn!("{}", e);
            self.pipeline.counters.record_staging_error();
        }
    }

    async fn link(&self, link: AlbumLink) {
        tracing::debug!("Linking {} into album {:?}", link.asset_id, link.album_name);
        self.associate(&link.remote_id, &link.album_name).await;
    }

    async fn associate(&self, remote_id: &str, album: &str) {
        let result = async {
            let album_id = self.albums.resolve(self.target.as_ref(), album).await?;
            self.target
                .add_assets_to_album(&album_id, &[remote_id.to_string()])
                .await
                .with_context(|| format!("Failed to add {} to album {:?}", remote_id, album))?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("{:#}", e);
            self.pipeline.counters.record_association_failed();
        }
    }

    /// Delete every asset pushed during the run from the source. Call only
    /// after the Puller and all Pushers have returned.
    pub(super) async fn remove_pushed_from_source(&self) {
        let ids = std::mem::take(&mut *self.pushed.lock().unwrap_or_else(PoisonError::into_inner));
        if ids.is_empty() {
            return;
        }
        tracing::info!("Removing {} migrated assets from {}", ids.len(), self.source.name());
        for batch in ids.chunks(REMOVE_BATCH) {
            match self.source.remove_assets(batch).await {
                Ok(removed) => self.pipeline.counters.record_source_removed(removed as u64),
                Err(e) => tracing::warn!(
                    "Failed to remove {} assets from {}: {}",
                    batch.len(),
                    self.source.name(),
                    e
                ),
            }
        }
    }
}
