//! Migration engine: one Puller feeding a pool of Pushers through a
//! deduplicating, backpressured work queue, with a local staging area in
//! between.

pub mod counters;
pub mod error;
pub mod puller;
pub mod pusher;
pub mod queue;
pub mod staging;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::repository::AssetRepository;
use counters::{Counters, CountersSnapshot, InfoSnapshot, SharedInfo};
pub use error::MigrateError;
pub use puller::PullFilter;
use puller::Puller;
use pusher::PusherPool;
use queue::{Backpressure, WorkQueue};
use staging::StagingArea;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Pushers drain the queue while the Puller is still filling it.
    Parallel,
    /// The Puller stages everything before the first push.
    Sequential,
}

/// Engine-facing run configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub staging_dir: PathBuf,
    pub pushers: usize,
    pub mode: PipelineMode,
    /// Delete pushed assets from the source once every Pusher has finished.
    pub move_assets: bool,
    pub filter: PullFilter,
    pub progress_interval: Option<Duration>,
}

/// State shared by every worker of a run.
pub(crate) struct Pipeline {
    pub(crate) queue: WorkQueue,
    pub(crate) staging: StagingArea,
    pub(crate) counters: Counters,
    pub(crate) info: SharedInfo,
}

impl Pipeline {
    pub(crate) fn new(
        source_name: &str,
        target_name: &str,
        staging_dir: PathBuf,
        pushers: usize,
        backpressure: Backpressure,
    ) -> Self {
        let queue = WorkQueue::new(backpressure);
        let info = SharedInfo::new(
            source_name,
            target_name,
            pushers,
            backpressure == Backpressure::Unthrottled,
            queue.depth_gauge(),
        );
        Self {
            queue,
            staging: StagingArea::new(staging_dir),
            counters: Counters::new(),
            info,
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub info: InfoSnapshot,
    pub counters: CountersSnapshot,
    /// Files still under the staging root after the final sweep.
    pub staging_leftovers: usize,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        let c = &self.counters;
        c.failed_assets() > 0 || c.failed_pull_albums > 0 || c.failed_album_associations > 0
    }
}

/// Run a full migration from `source` to `target`.
///
/// Cancelling `shutdown` stops discovery; whatever is already staged is
/// still pushed before this returns.
pub async fn migrate(
    source: Arc<dyn AssetRepository>,
    target: Arc<dyn AssetRepository>,
    config: &MigrationConfig,
    shutdown: CancellationToken,
) -> Result<RunReport, MigrateError> {
    if config.pushers == 0 {
        return Err(MigrateError::NoPushers);
    }
    let backpressure = match config.mode {
        PipelineMode::Parallel => Backpressure::Throttled,
        PipelineMode::Sequential => Backpressure::Unthrottled,
    };
    let pipeline = Arc::new(Pipeline::new(
        source.name(),
        target.name(),
        config.staging_dir.clone(),
        config.pushers,
        backpressure,
    ));
    pipeline.staging.prepare().await?;

    tracing::info!(
        "Migrating {} -> {} ({} pushers, {} mode)",
        source.name(),
        target.name(),
        config.pushers,
        match config.mode {
            PipelineMode::Parallel => "parallel",
            PipelineMode::Sequential => "sequential",
        }
    );

    let monitor_stop = CancellationToken::new();
    let monitor = config.progress_interval.map(|interval| {
        tokio::spawn(monitor_progress(
            Arc::clone(&pipeline),
            interval,
            monitor_stop.clone(),
        ))
    });

    let pool = Arc::new(PusherPool::new(
        Arc::clone(&source),
        target,
        Arc::clone(&pipeline),
        config.move_assets,
    ));
    let puller = Puller::new(source, Arc::clone(&pipeline), config.filter, shutdown);

    match config.mode {
        PipelineMode::Parallel => {
            let pushers = spawn_pushers(&pool, config.pushers);
            run_puller(puller, &pipeline, config.pushers).await;
            join_pushers(pushers).await;
        }
        PipelineMode::Sequential => {
            run_puller(puller, &pipeline, config.pushers).await;
            tracing::info!(
                "Pull phase complete, pushing {} staged items",
                pipeline.queue.depth().saturating_sub(config.pushers)
            );
            let pushers = spawn_pushers(&pool, config.pushers);
            join_pushers(pushers).await;
        }
    }
    // Album listings must not shrink under the Puller, so moved assets are
    // only deleted once nothing reads the source anymore.
    pool.remove_pushed_from_source().await;

    monitor_stop.cancel();
    if let Some(handle) = monitor {
        let _ = handle.await;
    }

    let staging_leftovers = pipeline.staging.sweep().await?;
    let report = RunReport {
        info: pipeline.info.snapshot(),
        counters: pipeline.counters.snapshot(),
        staging_leftovers,
    };
    log_summary(&report);
    Ok(report)
}

/// Run the Puller to completion, then release every Pusher. The termination
/// signals go out even if the Puller panics.
async fn run_puller(puller: Puller, pipeline: &Pipeline, pushers: usize) {
    let outcome = AssertUnwindSafe(puller.run().instrument(tracing::info_span!("puller")))
        .catch_unwind()
        .await;
    if let Err(panic) = outcome {
        tracing::error!("Puller crashed: {}", panic_message(panic.as_ref()));
        pipeline.counters.record_album_failed();
    }
    let pulled = pipeline.counters.pulled_assets();
    let indexed = pipeline.queue.index().len() as u64;
    if pulled != indexed {
        tracing::warn!("Pulled {} assets but indexed {}", pulled, indexed);
    }
    pipeline.queue.close(pushers).await;
}

fn spawn_pushers(pool: &Arc<PusherPool>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let pool = Arc::clone(pool);
            tokio::spawn(
                pool.run_worker(id)
                    .instrument(tracing::info_span!("pusher", id)),
            )
        })
        .collect()
}

async fn join_pushers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!("Pusher task failed: {}", e);
        }
    }
}

async fn monitor_progress(pipeline: Arc<Pipeline>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let c = pipeline.counters.snapshot();
                let info = pipeline.info.snapshot();
                tracing::info!(
                    "Progress: {} pulled, {} pushed, {} duplicates, {} failed, queue {}, {}",
                    c.pulled_assets,
                    c.pushed_assets,
                    c.push_duplicates,
                    c.failed_assets(),
                    info.queue_depth,
                    format_duration(pipeline.info.elapsed())
                );
            }
        }
    }
}

fn log_summary(report: &RunReport) {
    let c = &report.counters;
    let info = &report.info;
    tracing::info!("── Summary ──");
    tracing::info!("  {} -> {}", info.source, info.target);
    tracing::info!(
        "  source: {} albums, {} assets",
        info.source_albums,
        info.source_assets
    );
    tracing::info!(
        "  pulled: {} assets ({} photos, {} videos), {} albums",
        c.pulled_assets,
        c.pulled_photos,
        c.pulled_videos,
        c.pulled_albums
    );
    tracing::info!(
        "  pushed: {} assets ({} photos, {} videos), {} albums",
        c.pushed_assets,
        c.pushed_photos,
        c.pushed_videos,
        c.pushed_albums
    );
    tracing::info!(
        "  duplicates: {} on pull, {} already on target",
        c.pull_duplicates,
        c.push_duplicates
    );
    if report.has_failures() {
        tracing::warn!(
            "  failed: {} pulls, {} pushes, {} albums, {} album associations",
            c.failed_pull_assets,
            c.failed_push_assets,
            c.failed_pull_albums,
            c.failed_album_associations
        );
    }
    if c.blocked_albums > 0 {
        tracing::info!(
            "  blocked: {} shared albums ({} assets)",
            c.blocked_albums,
            c.blocked_assets
        );
    }
    if c.removed_source_assets > 0 {
        tracing::info!("  removed from source: {}", c.removed_source_assets);
    }
    if c.staging_errors > 0 {
        tracing::warn!("  {} staged files could not be cleaned up", c.staging_errors);
    }
    if report.staging_leftovers > 0 {
        tracing::warn!("  {} files left in staging", report.staging_leftovers);
    }
    tracing::info!("  elapsed: {}", format_duration(Duration::from_secs(info.elapsed_secs)));
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
