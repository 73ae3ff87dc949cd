//! Local staging area between pull and push.
//!
//! ```text
//! <root>/
//!   .active              present while unassociated assets are being pulled
//!   <file>               staged unassociated asset
//!   <album>/
//!     .active            present while the Puller is still working on the album
//!     <file>.lock        present only while <file> is being downloaded
//!     <file>             staged album asset
//! ```
//!
//! An album directory may only be removed once it is empty and its `.active`
//! marker is gone. `remove_dir` refuses non-empty directories, so a file that
//! lands between the check and the removal is never lost.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;

use super::counters::Counters;
use super::error::StagingError;
use crate::paths::album_dir_name;

pub const ACTIVE_MARKER: &str = ".active";
pub const LOCK_SUFFIX: &str = ".lock";

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    /// Albums whose staging directory has been removed and counted.
    processed_albums: Mutex<HashSet<String>>,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            processed_albums: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn album_dir(&self, album_name: &str) -> PathBuf {
        self.root.join(album_dir_name(album_name))
    }

    /// Create the root and clear leftovers of an interrupted run: markers,
    /// and partial downloads still carrying a `.lock`.
    pub async fn prepare(&self) -> Result<(), StagingError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StagingError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        let mut dirs = vec![self.root.clone()];
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|source| self.scan_error(source))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| self.scan_error(source))?
        {
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }

        let mut cleared = 0usize;
        for dir in dirs {
            cleared += clear_stale_markers(&dir).await?;
        }
        if cleared > 0 {
            tracing::info!(cleared, "Cleared stale staging markers from a previous run");
        }
        Ok(())
    }

    fn scan_error(&self, source: std::io::Error) -> StagingError {
        StagingError::Scan {
            path: self.root.clone(),
            source,
        }
    }

    /// Create an album's staging directory and mark it active.
    pub async fn begin_album(&self, album_name: &str) -> Result<PathBuf, StagingError> {
        let dir = self.album_dir(album_name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StagingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        self.mark_active(&dir).await?;
        Ok(dir)
    }

    pub async fn mark_active(&self, dir: &Path) -> Result<(), StagingError> {
        let marker = dir.join(ACTIVE_MARKER);
        fs::write(&marker, b"")
            .await
            .map_err(|source| StagingError::Marker {
                path: marker,
                source,
            })
    }

    pub async fn clear_active(&self, dir: &Path) -> Result<(), StagingError> {
        remove_if_present(&dir.join(ACTIVE_MARKER)).await
    }

    /// Write the per-asset download marker for `staged`.
    pub async fn lock(&self, staged: &Path) -> Result<PathBuf, StagingError> {
        let marker = lock_path(staged);
        fs::write(&marker, b"")
            .await
            .map_err(|source| StagingError::Marker {
                path: marker.clone(),
                source,
            })?;
        Ok(marker)
    }

    pub async fn unlock(&self, marker: &Path) -> Result<(), StagingError> {
        remove_if_present(marker).await
    }

    pub async fn remove_staged(&self, staged: &Path) -> Result<(), StagingError> {
        remove_if_present(staged).await
    }

    /// Remove a directory if it's empty; `false` when it still has entries
    /// or is already gone.
    pub async fn remove_empty_dir(&self, dir: &Path) -> bool {
        match fs::remove_dir(dir).await {
            Ok(()) => true,
            Err(e) => {
                if !is_not_found(&e) {
                    tracing::debug!(dir = %dir.display(), "Staging directory kept: {}", e);
                }
                false
            }
        }
    }

    /// Remove a finished album's staging directory and count it as pushed.
    ///
    /// No-op unless `.active` is absent, the directory is empty and the album
    /// hasn't been processed yet. Safe to call from any worker, any number of
    /// times.
    pub async fn try_finalize_album(&self, album_name: &str, counters: &Counters) -> bool {
        let dir = self.album_dir(album_name);
        let mut processed = self.processed_albums.lock().await;
        if processed.contains(album_name) {
            return false;
        }
        if fs::try_exists(dir.join(ACTIVE_MARKER))
            .await
            .unwrap_or(true)
        {
            return false;
        }
        if !self.remove_empty_dir(&dir).await {
            return false;
        }
        processed.insert(album_name.to_string());
        if !counters.record_pushed_album() {
            tracing::debug!(album = album_name, "Pushed album count clamped");
        }
        tracing::info!(album = album_name, "Album migrated");
        true
    }

    /// Final sweep: clear stale markers, remove every empty directory under
    /// the root, then the root itself. Returns the number of leftover files
    /// found.
    pub async fn sweep(&self) -> Result<usize, StagingError> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(0);
        }
        clear_stale_markers(&self.root).await?;
        let mut leftovers = 0usize;
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|source| self.scan_error(source))?;
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| self.scan_error(source))?
        {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                tracing::warn!(path = %path.display(), "Staged file left behind");
                leftovers += 1;
            }
        }
        for dir in dirs {
            // No worker is running anymore, so any marker left is stale.
            clear_stale_markers(&dir).await?;
            if !self.remove_empty_dir(&dir).await {
                let count = count_files(&dir).await?;
                if count > 0 {
                    tracing::warn!(dir = %dir.display(), files = count, "Staging directory not empty");
                }
                leftovers += count;
            }
        }
        self.remove_empty_dir(&self.root).await;
        Ok(leftovers)
    }
}

fn lock_path(staged: &Path) -> PathBuf {
    let mut name = staged
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    staged.with_file_name(name)
}

async fn remove_if_present(path: &Path) -> Result<(), StagingError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(source) => Err(StagingError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove `.active` markers and `<file>.lock` pairs directly inside `dir`.
async fn clear_stale_markers(dir: &Path) -> Result<usize, StagingError> {
    let scan_error = |source| StagingError::Scan {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir).await.map_err(scan_error)?;
    let mut cleared = 0usize;
    while let Some(entry) = entries.next_entry().await.map_err(scan_error)? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == ACTIVE_MARKER {
            remove_if_present(&path).await?;
            cleared += 1;
        } else if let Some(partial) = name.strip_suffix(LOCK_SUFFIX) {
            remove_if_present(&dir.join(partial)).await?;
            remove_if_present(&path).await?;
            cleared += 1;
        }
    }
    Ok(cleared)
}

async fn count_files(dir: &Path) -> Result<usize, StagingError> {
    let scan_error = |source| StagingError::Scan {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir).await.map_err(scan_error)?;
    let mut count = 0usize;
    while let Some(entry) = entries.next_entry().await.map_err(scan_error)? {
        if entry.path().is_file() {
            count += 1;
        }
    }
    Ok(count)
}
