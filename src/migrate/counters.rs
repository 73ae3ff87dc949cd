//! Process-wide accounting for a migration run.
//!
//! Only the Puller and the Pushers mutate [`Counters`]; anything else (the
//! progress monitor, the final summary) reads snapshots. Plain counters use
//! relaxed atomics. The album counters use `SeqCst` because the pushed-album
//! clamp reads the pulled-album count inside its update.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::AssetKind;

#[derive(Debug, Default)]
pub struct Counters {
    pulled_assets: AtomicU64,
    pulled_photos: AtomicU64,
    pulled_videos: AtomicU64,
    pulled_albums: AtomicU64,

    pushed_assets: AtomicU64,
    pushed_photos: AtomicU64,
    pushed_videos: AtomicU64,
    pushed_albums: AtomicU64,

    failed_pull_assets: AtomicU64,
    failed_pull_photos: AtomicU64,
    failed_pull_videos: AtomicU64,
    failed_pull_albums: AtomicU64,

    failed_push_assets: AtomicU64,
    failed_push_photos: AtomicU64,
    failed_push_videos: AtomicU64,
    failed_album_associations: AtomicU64,

    pull_duplicates: AtomicU64,
    push_duplicates: AtomicU64,

    blocked_albums: AtomicU64,
    blocked_assets: AtomicU64,

    removed_source_assets: AtomicU64,
    staging_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pulled(&self, kind: AssetKind) {
        bump(&self.pulled_assets);
        match kind {
            AssetKind::Photo => bump(&self.pulled_photos),
            AssetKind::Video => bump(&self.pulled_videos),
        }
    }

    pub fn record_pull_failed(&self, kind: AssetKind) {
        bump(&self.failed_pull_assets);
        match kind {
            AssetKind::Photo => bump(&self.failed_pull_photos),
            AssetKind::Video => bump(&self.failed_pull_videos),
        }
    }

    pub fn record_pushed(&self, kind: AssetKind) {
        bump(&self.pushed_assets);
        match kind {
            AssetKind::Photo => bump(&self.pushed_photos),
            AssetKind::Video => bump(&self.pushed_videos),
        }
    }

    pub fn record_push_failed(&self, kind: AssetKind) {
        bump(&self.failed_push_assets);
        match kind {
            AssetKind::Photo => bump(&self.failed_push_photos),
            AssetKind::Video => bump(&self.failed_push_videos),
        }
    }

    pub fn record_pull_duplicate(&self) {
        bump(&self.pull_duplicates);
    }

    pub fn record_push_duplicate(&self) {
        bump(&self.push_duplicates);
    }

    pub fn record_album_failed(&self) {
        bump(&self.failed_pull_albums);
    }

    pub fn record_association_failed(&self) {
        bump(&self.failed_album_associations);
    }

    pub fn record_blocked_album(&self, asset_count: u64) {
        bump(&self.blocked_albums);
        self.blocked_assets.fetch_add(asset_count, Ordering::Relaxed);
    }

    pub fn record_source_removed(&self, count: u64) {
        self.removed_source_assets
            .fetch_add(count, Ordering::Relaxed);
    }

    /// A staged file could not be cleaned up after its push.
    pub fn record_staging_error(&self) {
        bump(&self.staging_errors);
    }

    pub fn record_pulled_album(&self) {
        self.pulled_albums.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a finished album, never letting pushed albums exceed pulled ones.
    ///
    /// Returns `false` when the clamp refused the increment.
    pub fn record_pushed_album(&self) -> bool {
        self.pushed_albums
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pushed| {
                let pulled = self.pulled_albums.load(Ordering::SeqCst);
                (pushed < pulled).then_some(pushed + 1)
            })
            .is_ok()
    }

    pub fn pulled_assets(&self) -> u64 {
        self.pulled_assets.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        // Read pushed before pulled so the snapshot itself honours the clamp.
        let pushed_albums = self.pushed_albums.load(Ordering::SeqCst);
        let pulled_albums = self.pulled_albums.load(Ordering::SeqCst);
        CountersSnapshot {
            pulled_assets: load(&self.pulled_assets),
            pulled_photos: load(&self.pulled_photos),
            pulled_videos: load(&self.pulled_videos),
            pulled_albums,
            pushed_assets: load(&self.pushed_assets),
            pushed_photos: load(&self.pushed_photos),
            pushed_videos: load(&self.pushed_videos),
            pushed_albums,
            failed_pull_assets: load(&self.failed_pull_assets),
            failed_pull_photos: load(&self.failed_pull_photos),
            failed_pull_videos: load(&self.failed_pull_videos),
            failed_pull_albums: load(&self.failed_pull_albums),
            failed_push_assets: load(&self.failed_push_assets),
            failed_push_photos: load(&self.failed_push_photos),
            failed_push_videos: load(&self.failed_push_videos),
            failed_album_associations: load(&self.failed_album_associations),
            pull_duplicates: load(&self.pull_duplicates),
            push_duplicates: load(&self.push_duplicates),
            blocked_albums: load(&self.blocked_albums),
            blocked_assets: load(&self.blocked_assets),
            removed_source_assets: load(&self.removed_source_assets),
            staging_errors: load(&self.staging_errors),
        }
    }
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub pulled_assets: u64,
    pub pulled_photos: u64,
    pub pulled_videos: u64,
    pub pulled_albums: u64,
    pub pushed_assets: u64,
    pub pushed_photos: u64,
    pub pushed_videos: u64,
    pub pushed_albums: u64,
    pub failed_pull_assets: u64,
    pub failed_pull_photos: u64,
    pub failed_pull_videos: u64,
    pub failed_pull_albums: u64,
    pub failed_push_assets: u64,
    pub failed_push_photos: u64,
    pub failed_push_videos: u64,
    pub failed_album_associations: u64,
    pub pull_duplicates: u64,
    pub push_duplicates: u64,
    pub blocked_albums: u64,
    pub blocked_assets: u64,
    pub removed_source_assets: u64,
    pub staging_errors: u64,
}

impl CountersSnapshot {
    /// Assets that did not make it to the target.
    pub fn failed_assets(&self) -> u64 {
        self.failed_pull_assets + self.failed_push_assets
    }
}

/// Read-mostly run metadata. Stale reads are fine; nothing depends on them
/// for correctness.
#[derive(Debug)]
pub struct SharedInfo {
    source_name: String,
    target_name: String,
    pushers: usize,
    sequential: bool,
    started: DateTime<Utc>,
    started_at: Instant,
    source_albums: AtomicU64,
    source_assets: AtomicU64,
    queue_depth: Arc<AtomicUsize>,
}

impl SharedInfo {
    pub fn new(
        source_name: &str,
        target_name: &str,
        pushers: usize,
        sequential: bool,
        queue_depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            target_name: target_name.to_string(),
            pushers,
            sequential,
            started: Utc::now(),
            started_at: Instant::now(),
            source_albums: AtomicU64::new(0),
            source_assets: AtomicU64::new(0),
            queue_depth,
        }
    }

    /// Accumulate totals discovered while listing the source.
    pub fn add_source_totals(&self, albums: u64, assets: u64) {
        self.source_albums.fetch_add(albums, Ordering::Relaxed);
        self.source_assets.fetch_add(assets, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> InfoSnapshot {
        InfoSnapshot {
            source: self.source_name.clone(),
            target: self.target_name.clone(),
            pushers: self.pushers,
            sequential: self.sequential,
            started: self.started,
            elapsed_secs: self.elapsed().as_secs(),
            source_albums: self.source_albums.load(Ordering::Relaxed),
            source_assets: self.source_assets.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoSnapshot {
    pub source: String,
    pub target: String,
    pub pushers: usize,
    pub sequential: bool,
    pub started: DateTime<Utc>,
    pub elapsed_secs: u64,
    pub source_albums: u64,
    pub source_assets: u64,
    pub queue_depth: usize,
}
