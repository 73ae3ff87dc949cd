//! Work queue between the Puller and the Pushers.
//!
//! Every staged file enters the queue at most once: [`WorkQueue::enqueue_unique`]
//! registers the staged path (and its source asset) in the [`DedupIndex`]
//! before admitting it. In throttled mode the producer is slowed as the queue
//! grows and paused outright at the high-water mark until Pushers drain it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

use crate::types::AssetKind;

/// Depth at which the producer pauses.
pub const HIGH_WATER: usize = 100;
/// Depth the queue must drain to before a paused producer resumes.
pub const RESUME_AT: usize = 25;
/// Depth from which each admission is delayed by [`SLOW_DOWN_DELAY`].
pub const SLOW_DOWN_AT: usize = 50;
pub const SLOW_DOWN_DELAY: Duration = Duration::from_millis(100);

/// A staged asset waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub asset_id: String,
    /// Identity key of the item.
    pub staged_path: PathBuf,
    pub asset_time: DateTime<Utc>,
    pub kind: AssetKind,
    pub album_name: Option<String>,
}

/// Association of an already-pushed asset with one more target album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumLink {
    pub asset_id: String,
    pub remote_id: String,
    pub album_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    Transfer(TransferItem),
    Link(AlbumLink),
    /// Consumed by exactly one Pusher, which then stops.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Pull and push run concurrently; regulate the producer.
    Throttled,
    /// Pull runs to completion before any push; never wait.
    Unthrottled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

/// What the index knows about a source asset the Puller is about to stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// Never staged; go ahead.
    New,
    /// Staged and waiting to be pushed; the album was recorded against it.
    Pending,
    /// Already pushed under this remote id; the album still needs linking.
    Pushed(String),
    /// Already seen; nothing further to do for this album.
    Known,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Queued,
    Pushed(String),
    Failed,
}

#[derive(Debug)]
struct AssetEntry {
    /// Every album this asset was discovered in, primary first.
    albums: Vec<String>,
    /// Albums recorded after the item was queued, not yet handed to a Pusher.
    pending_albums: Vec<String>,
    state: EntryState,
}

#[derive(Debug, Default)]
struct DedupState {
    paths: HashSet<PathBuf>,
    assets: HashMap<String, AssetEntry>,
}

/// Staged paths admitted to the queue during this run. Only grows.
#[derive(Debug, Default)]
pub struct DedupIndex {
    state: Mutex<DedupState>,
}

impl DedupIndex {
    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of staged paths admitted so far.
    pub fn len(&self) -> usize {
        self.lock().paths.len()
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.lock().paths.contains(path)
    }

    /// Look up a source asset before staging it, recording `album` as an
    /// extra membership when the asset is already known.
    pub fn claim(&self, asset_id: &str, album: Option<&str>) -> Membership {
        let mut state = self.lock();
        let Some(entry) = state.assets.get_mut(asset_id) else {
            return Membership::New;
        };
        let Some(album) = album else {
            return Membership::Known;
        };
        if entry.albums.iter().any(|a| a == album) {
            return Membership::Known;
        }
        entry.albums.push(album.to_string());
        match &entry.state {
            EntryState::Queued => {
                entry.pending_albums.push(album.to_string());
                Membership::Pending
            }
            EntryState::Pushed(remote_id) => Membership::Pushed(remote_id.clone()),
            EntryState::Failed => Membership::Known,
        }
    }

    /// Register an item; `false` when its path or asset is already known.
    fn register(&self, item: &TransferItem) -> bool {
        let mut state = self.lock();
        if state.paths.contains(&item.staged_path) || state.assets.contains_key(&item.asset_id) {
            return false;
        }
        state.paths.insert(item.staged_path.clone());
        state.assets.insert(
            item.asset_id.clone(),
            AssetEntry {
                albums: item.album_name.iter().cloned().collect(),
                pending_albums: Vec::new(),
                state: EntryState::Queued,
            },
        );
        true
    }

    /// Record the push result for an asset and hand back the albums recorded
    /// against it since it was queued.
    pub fn settle(&self, asset_id: &str, remote_id: Option<&str>) -> Vec<String> {
        let mut state = self.lock();
        let Some(entry) = state.assets.get_mut(asset_id) else {
            return Vec::new();
        };
        entry.state = match remote_id {
            Some(id) => EntryState::Pushed(id.to_string()),
            None => EntryState::Failed,
        };
        std::mem::take(&mut entry.pending_albums)
    }
}

/// Multi-consumer FIFO of [`QueueMessage`]s with producer backpressure.
#[derive(Debug)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
    depth: Arc<AtomicUsize>,
    drained: Notify,
    index: DedupIndex,
    backpressure: Backpressure,
}

impl WorkQueue {
    pub fn new(backpressure: Backpressure) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: Arc::new(AtomicUsize::new(0)),
            drained: Notify::new(),
            index: DedupIndex::default(),
            backpressure,
        }
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Shared handle on the depth counter, for read-only observers.
    pub fn depth_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    /// Admit a staged item unless its path (or source asset) was already
    /// admitted during this run.
    pub async fn enqueue_unique(&self, item: TransferItem) -> Admission {
        if !self.index.register(&item) {
            tracing::debug!(path = %item.staged_path.display(), "Rejected already-queued item");
            return Admission::Rejected;
        }
        self.admit(QueueMessage::Transfer(item)).await;
        Admission::Admitted
    }

    pub async fn enqueue_link(&self, link: AlbumLink) {
        self.admit(QueueMessage::Link(link)).await;
    }

    /// Enqueue one termination signal per consumer.
    pub async fn close(&self, consumers: usize) {
        for _ in 0..consumers {
            self.admit(QueueMessage::Terminate).await;
        }
    }

    /// Wait for the next message. `None` only if every sender is gone, which
    /// can't happen while the queue itself is alive.
    pub async fn dequeue(&self) -> Option<QueueMessage> {
        let message = self.rx.lock().await.recv().await;
        if message.is_some() {
            let left = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
            if left <= RESUME_AT {
                self.drained.notify_waiters();
            }
        }
        message
    }

    async fn admit(&self, message: QueueMessage) {
        self.throttle().await;
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::error!("Work queue receiver dropped; message lost");
        }
    }

    async fn throttle(&self) {
        if self.backpressure == Backpressure::Unthrottled {
            return;
        }
        let depth = self.depth();
        if depth >= HIGH_WATER {
            tracing::debug!(depth, "Work queue full, pausing producer");
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                // Register before re-checking so a drain in between isn't missed.
                notified.as_mut().enable();
                if self.depth() <= RESUME_AT {
                    break;
                }
                notified.await;
            }
            tracing::debug!(depth = self.depth(), "Work queue drained, resuming producer");
        } else if depth >= SLOW_DOWN_AT {
            tokio::time::sleep(SLOW_DOWN_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, path: &str) -> TransferItem {
        TransferItem {
            asset_id: id.to_string(),
            staged_path: PathBuf::from(path),
            asset_time: Utc::now(),
            kind: AssetKind::Photo,
            album_name: Some("A".to_string()),
        }
    }

    #[tokio::test]
    async fn test_enqueue_unique_rejects_known_path() {
        let queue = WorkQueue::new(Backpressure::Unthrottled);
        assert_eq!(queue.enqueue_unique(item("1", "/s/a.jpg")).await, Admission::Admitted);
        assert_eq!(queue.enqueue_unique(item("2", "/s/a.jpg")).await, Admission::Rejected);
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.index().len(), 1);
        assert!(queue.index().contains_path(Path::new("/s/a.jpg")));
    }

    #[tokio::test]
    async fn test_enqueue_unique_rejects_known_asset() {
        let queue = WorkQueue::new(Backpressure::Unthrottled);
        assert_eq!(queue.enqueue_unique(item("1", "/s/A/a.jpg")).await, Admission::Admitted);
        assert_eq!(queue.enqueue_unique(item("1", "/s/B/a.jpg")).await, Admission::Rejected);
        assert!(!queue.index().contains_path(Path::new("/s/B/a.jpg")));
    }

    #[tokio::test]
    async fn test_fifo_and_depth_tracking() {
        let queue = WorkQueue::new(Backpressure::Unthrottled);
        queue.enqueue_unique(item("1", "/s/1.jpg")).await;
        queue.enqueue_unique(item("2", "/s/2.jpg")).await;
        assert_eq!(queue.depth(), 2);
        match queue.dequeue().await {
            Some(QueueMessage::Transfer(i)) => assert_eq!(i.asset_id, "1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.depth_gauge().load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_delivers_one_signal_per_consumer() {
        let queue = Arc::new(WorkQueue::new(Backpressure::Throttled));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut seen = 0usize;
                    while let Some(msg) = queue.dequeue().await {
                        match msg {
                            QueueMessage::Terminate => break,
                            _ => seen += 1,
                        }
                    }
                    seen
                })
            })
            .collect();

        for i in 0..20 {
            queue
                .enqueue_unique(item(&i.to_string(), &format!("/s/{}.jpg", i)))
                .await;
        }
        queue.close(4).await;

        let mut total = 0;
        for handle in consumers {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 20);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_never_exceeds_high_water_after_enqueue() {
        let queue = Arc::new(WorkQueue::new(Backpressure::Throttled));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    if let Some(QueueMessage::Terminate) = queue.dequeue().await {
                        break;
                    }
                }
            })
        };

        for i in 0..400 {
            queue
                .enqueue_unique(item(&i.to_string(), &format!("/s/{}.jpg", i)))
                .await;
            assert!(queue.depth() <= HIGH_WATER, "depth {}", queue.depth());
        }
        queue.close(1).await;
        consumer.await.unwrap();
        assert_eq!(queue.index().len(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_pauses_until_drained_to_resume_mark() {
        let queue = Arc::new(WorkQueue::new(Backpressure::Throttled));
        for i in 0..HIGH_WATER {
            queue
                .enqueue_unique(item(&i.to_string(), &format!("/s/{}.jpg", i)))
                .await;
        }
        assert_eq!(queue.depth(), HIGH_WATER);

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue_unique(item("x", "/s/x.jpg")).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!producer.is_finished());

        // Drain to one above the resume mark: still paused.
        for _ in 0..(HIGH_WATER - RESUME_AT - 1) {
            queue.dequeue().await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!producer.is_finished());

        queue.dequeue().await;
        assert_eq!(producer.await.unwrap(), Admission::Admitted);
        assert_eq!(queue.depth(), RESUME_AT + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_band_delays_each_admission() {
        let queue = WorkQueue::new(Backpressure::Throttled);
        for i in 0..(SLOW_DOWN_AT - 1) {
            queue
                .enqueue_unique(item(&i.to_string(), &format!("/s/{}.jpg", i)))
                .await;
        }

        let started = tokio::time::Instant::now();
        queue.enqueue_unique(item("below", "/s/below.jpg")).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(queue.depth(), SLOW_DOWN_AT);

        for i in SLOW_DOWN_AT..60 {
            let started = tokio::time::Instant::now();
            queue
                .enqueue_unique(item(&i.to_string(), &format!("/s/{}.jpg", i)))
                .await;
            assert_eq!(started.elapsed(), SLOW_DOWN_DELAY, "depth {}", i);
        }
        assert_eq!(queue.depth(), 60);
    }

    #[tokio::test]
    async fn test_unthrottled_never_waits() {
        let queue = WorkQueue::new(Backpressure::Unthrottled);
        for i in 0..(HIGH_WATER * 3) {
            queue
                .enqueue_unique(item(&i.to_string(), &format!("/s/{}.jpg", i)))
                .await;
        }
        assert_eq!(queue.depth(), HIGH_WATER * 3);
    }

    #[test]
    fn test_claim_records_extra_album_while_queued() {
        let index = DedupIndex::default();
        assert_eq!(index.claim("1", Some("A")), Membership::New);
        assert!(index.register(&item("1", "/s/A/a.jpg")));

        assert_eq!(index.claim("1", Some("A")), Membership::Known);
        assert_eq!(index.claim("1", Some("B")), Membership::Pending);
        assert_eq!(index.claim("1", Some("B")), Membership::Known);
        assert_eq!(index.claim("1", None), Membership::Known);

        assert_eq!(index.settle("1", Some("r1")), vec!["B".to_string()]);
        assert_eq!(index.claim("1", Some("C")), Membership::Pushed("r1".to_string()));
        assert!(index.settle("1", Some("r1")).is_empty());
    }

    #[test]
    fn test_claim_after_failed_push_is_known() {
        let index = DedupIndex::default();
        assert!(index.register(&item("1", "/s/A/a.jpg")));
        assert!(index.settle("1", None).is_empty());
        assert_eq!(index.claim("1", Some("B")), Membership::Known);
    }

    #[test]
    fn test_settle_unknown_asset_is_empty() {
        let index = DedupIndex::default();
        assert!(index.settle("nope", Some("r")).is_empty());
    }
}
