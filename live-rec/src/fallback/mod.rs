//! Protocol fallback: retry policy plus the persistent fallback sets.
//!
//! Two sets decide which protocol a session starts on:
//!
//! - the *learned* set, grown by the engine whenever a target exhausts its
//!   primary attempts; persisted as one name per line and only ever reset by
//!   editing the file;
//! - the *pinned* set, maintained by an operator in a separate file and
//!   reloaded periodically.

mod policy;

use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::fs;
use crate::{Error, Result};

pub use policy::{CaptureState, Decision, FallbackPolicy, Protocol, RetryConfig};

/// Parse a newline-separated name list. Blank lines and `#` comments are
/// ignored.
pub fn parse_name_list(raw: &str) -> BTreeSet<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

async fn read_name_list(path: &Path) -> Result<BTreeSet<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(parse_name_list(&raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(Error::io_path("reading name list", path, e)),
    }
}

/// Learned and pinned fallback membership.
#[derive(Debug)]
pub struct FallbackSets {
    learned_path: Option<PathBuf>,
    learned: Mutex<BTreeSet<String>>,
    learned_view: RwLock<HashSet<String>>,
    pinned: RwLock<HashSet<String>>,
}

impl FallbackSets {
    /// Sets that live only in memory.
    pub fn in_memory() -> Self {
        Self {
            learned_path: None,
            learned: Mutex::new(BTreeSet::new()),
            learned_view: RwLock::new(HashSet::new()),
            pinned: RwLock::new(HashSet::new()),
        }
    }

    /// Load both sets from disk. Missing files are empty sets.
    pub async fn load(learned_path: impl Into<PathBuf>, pinned_path: Option<&Path>) -> Result<Self> {
        let learned_path = learned_path.into();
        let learned = read_name_list(&learned_path).await?;
        let pinned = match pinned_path {
            Some(path) => read_name_list(path).await?,
            None => BTreeSet::new(),
        };

        info!(
            learned = learned.len(),
            pinned = pinned.len(),
            "Loaded fallback sets"
        );

        Ok(Self {
            learned_path: Some(learned_path),
            learned_view: RwLock::new(learned.iter().cloned().collect()),
            learned: Mutex::new(learned),
            pinned: RwLock::new(pinned.into_iter().collect()),
        })
    }

    pub fn is_learned(&self, target: &str) -> bool {
        self.learned_view.read().contains(target)
    }

    pub fn is_pinned(&self, target: &str) -> bool {
        self.pinned.read().contains(target)
    }

    /// Protocol a new session for `target` starts on.
    ///
    /// `None` means the target is pinned to the secondary protocol but has no
    /// secondary URL, so no attempt should be made.
    pub fn initial_protocol(&self, target: &str, has_secondary: bool) -> Option<Protocol> {
        if self.is_pinned(target) {
            return has_secondary.then_some(Protocol::Secondary);
        }
        if has_secondary && self.is_learned(target) {
            return Some(Protocol::Secondary);
        }
        Some(Protocol::Primary)
    }

    /// Add `target` to the learned set and persist it.
    ///
    /// The file is re-read first so operator edits made while running are
    /// not overwritten. Returns `true` if the target was newly added.
    pub async fn learn(&self, target: &str) -> Result<bool> {
        let mut learned = self.learned.lock().await;

        if let Some(path) = &self.learned_path {
            *learned = read_name_list(path).await?;
        }
        let added = learned.insert(target.to_string());

        if added {
            if let Some(path) = &self.learned_path {
                let mut body = learned.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
                body.push('\n');
                fs::write_atomic(path, body.as_bytes()).await?;
            }
            info!(target_name = %target, "Target added to fallback set");
        }

        *self.learned_view.write() = learned.iter().cloned().collect();
        Ok(added)
    }

    /// Replace the pinned set.
    pub fn set_pinned(&self, names: impl IntoIterator<Item = String>) {
        let next: HashSet<String> = names.into_iter().collect();
        let mut pinned = self.pinned.write();
        if *pinned != next {
            debug!(count = next.len(), "Pinned fallback set updated");
            *pinned = next;
        }
    }

    /// Re-read the pinned set from `path`.
    pub async fn reload_pinned(&self, path: &Path) -> Result<()> {
        let names = read_name_list(path).await?;
        self.set_pinned(names);
        Ok(())
    }

    /// Learned members, sorted.
    pub fn learned(&self) -> Vec<String> {
        let mut names: Vec<String> = self.learned_view.read().iter().cloned().collect();
        names.sort();
        names
    }
}

/// Periodically reload the pinned set from `path`.
pub fn spawn_pinned_refresh(
    sets: Arc<FallbackSets>,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sets.reload_pinned(&path).await {
                        warn!(error = %e, "Failed to reload pinned fallback set");
                    }
                }
            }
        }
    })
}
