//! Per-target capture locks.
//!
//! A lock marks "a capture for this target is in progress". Markers are
//! persistent so external status tooling can observe them and so a crash
//! leaves evidence behind; the engine purges every marker at startup because
//! no worker from a previous process can still own one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::utils::filename::target_key;
use crate::{Error, Result};

/// File extension of lock markers.
const LOCK_EXTENSION: &str = "lock";

/// Persistent key-presence store backing the lock manager.
///
/// `try_acquire` must be atomic: of two concurrent callers for the same
/// target, exactly one observes `true`. Distinct target names never share
/// a marker.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the marker for `target`; `false` if it already exists.
    async fn try_acquire(&self, target: &str) -> Result<bool>;

    /// Remove the marker for `target`. Missing markers are not an error.
    async fn release(&self, target: &str) -> Result<()>;

    /// Synchronous [`release`](Self::release), for guards dropped without
    /// an explicit release.
    fn release_blocking(&self, target: &str) -> Result<()>;

    /// Whether a marker for `target` currently exists.
    async fn is_locked(&self, target: &str) -> bool;

    /// Remove every marker, returning how many were removed.
    async fn purge_all(&self) -> Result<usize>;

    /// Targets that currently hold a marker.
    async fn locked_targets(&self) -> Result<Vec<String>>;
}

/// Lock markers as files: `<dir>/<target key>.lock`.
///
/// The file body records the raw target name and acquisition time.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    /// Use `dir` for markers, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        crate::utils::fs::ensure_dir_all_sync_with_op("creating lock directory", &dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker path for `target`.
    pub fn lock_path(&self, target: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{LOCK_EXTENSION}", target_key(target)))
    }

    fn is_marker_name(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(LOCK_EXTENSION)
    }

    /// Marker files currently in the lock directory.
    async fn markers(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io_path("listing locks", &self.dir, e))?;

        let mut markers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("listing locks", &self.dir, e))?
        {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && Self::is_marker_name(&path) {
                markers.push(path);
            }
        }
        Ok(markers)
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_acquire(&self, target: &str) -> Result<bool> {
        let path = self.lock_path(target);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut file) => {
                let body = format!("{target}\n{}\n", Local::now().to_rfc3339());
                if let Err(e) = file.write_all(body.as_bytes()).await {
                    // The marker exists, which is all exclusion needs.
                    warn!(target_name = %target, error = %e, "Failed to write lock body");
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::io_path("creating lock", &path, e)),
        }
    }

    async fn release(&self, target: &str) -> Result<()> {
        let path = self.lock_path(target);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_path("removing lock", &path, e)),
        }
    }

    fn release_blocking(&self, target: &str) -> Result<()> {
        let path = self.lock_path(target);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_path("removing lock", &path, e)),
        }
    }

    async fn is_locked(&self, target: &str) -> bool {
        tokio::fs::try_exists(self.lock_path(target))
            .await
            .unwrap_or(false)
    }

    async fn purge_all(&self) -> Result<usize> {
        let mut purged = 0;
        for path in self.markers().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io_path("removing stale lock", &path, e)),
            }
        }
        Ok(purged)
    }

    async fn locked_targets(&self) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        for path in self.markers().await? {
            let from_body = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|body| body.lines().next().map(str::to_string))
                .filter(|name| !name.is_empty());
            let name = from_body.or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            });
            targets.extend(name);
        }
        targets.sort();
        Ok(targets)
    }
}

/// Entry point the engine uses for locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// File-backed manager rooted at `dir`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileLockStore::new(dir)?)))
    }

    /// Atomically take the lock for `target`.
    ///
    /// `Ok(None)` means another worker owns it. The returned guard releases
    /// the lock when dropped.
    pub async fn try_acquire(&self, target: &str) -> Result<Option<LockGuard>> {
        if self.store.try_acquire(target).await? {
            debug!(target_name = %target, "Lock acquired");
            Ok(Some(LockGuard {
                store: self.store.clone(),
                target: target.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn is_locked(&self, target: &str) -> bool {
        self.store.is_locked(target).await
    }

    /// Drop every lock left by a previous process.
    ///
    /// Must run before the first dispatch cycle.
    pub async fn purge_all(&self) -> Result<usize> {
        let purged = self.store.purge_all().await?;
        if purged > 0 {
            info!(count = purged, "Purged stale capture locks");
        }
        Ok(purged)
    }

    pub async fn locked_targets(&self) -> Result<Vec<String>> {
        self.store.locked_targets().await
    }
}

/// Ownership of one target's lock; releases on drop.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    target: String,
    released: bool,
}

impl LockGuard {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Release now, reporting any failure.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.store.release(&self.target).await;
        if result.is_ok() {
            debug!(target_name = %self.target, "Lock released");
        }
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_blocking(&self.target) {
            warn!(target_name = %self.target, error = %e, "Failed to release lock");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("target", &self.target)
            .field("released", &self.released)
            .finish()
    }
}
