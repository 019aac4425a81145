//! File-backed target source.
//!
//! The resolver publishes a JSON object keyed by target name. Each value is
//! either a bare primary URL or an object with `primary` and optional
//! `secondary` URLs:
//!
//! ```json
//! {
//!   "alice": "https://cdn.example/stream-7301_or4.m3u8",
//!   "bob": { "primary": "https://cdn.example/stream-99_or4.m3u8",
//!            "secondary": "https://cdn.example/stream-99_or4.flv" }
//! }
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Target, TargetRegistry};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Url(String),
    Urls {
        #[serde(alias = "primary_url")]
        primary: String,
        #[serde(default, alias = "secondary_url")]
        secondary: Option<String>,
    },
}

/// Reads targets from the resolver's JSON file.
#[derive(Debug, Clone)]
pub struct FileTargetSource {
    path: PathBuf,
}

impl FileTargetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current targets.
    ///
    /// A missing file yields no targets. Entries with an empty primary URL
    /// are skipped.
    pub async fn load(&self) -> Result<Vec<Target>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Targets file not present yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::io_path("reading targets", &self.path, e)),
        };
        Self::parse(&raw)
    }

    /// Parse the resolver JSON document.
    pub fn parse(raw: &str) -> Result<Vec<Target>> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: BTreeMap<String, TargetEntry> = serde_json::from_str(raw)?;
        let targets = entries
            .into_iter()
            .filter_map(|(name, entry)| {
                let (primary, secondary) = match entry {
                    TargetEntry::Url(url) => (url, None),
                    TargetEntry::Urls { primary, secondary } => (primary, secondary),
                };
                let name = name.trim().to_string();
                let primary = primary.trim().to_string();
                if name.is_empty() || primary.is_empty() {
                    warn!(target_name = %name, "Skipping target without a primary URL");
                    return None;
                }
                Some(Target {
                    name,
                    primary_url: primary,
                    secondary_url: secondary
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                })
            })
            .collect();
        Ok(targets)
    }
}

/// Poll `source` every `interval` and mirror it into `registry`.
///
/// A read or parse failure keeps the previous registry contents, since the
/// resolver may be mid-write.
pub fn spawn_refresh(
    registry: Arc<TargetRegistry>,
    source: FileTargetSource,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(path = %source.path().display(), "Target registry refresh started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Target registry refresh shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match source.load().await {
                        Ok(targets) => {
                            registry.replace_all(targets);
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to refresh targets, keeping previous set");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_both_entry_shapes() {
        let targets = FileTargetSource::parse(
            r#"{
                "bob": {"primary": "https://x/stream-2_a.m3u8", "secondary": "https://x/stream-2_a.flv"},
                "alice": "https://x/stream-1_a.m3u8",
                "carol": {"primary_url": "https://x/3.m3u8", "secondary_url": ""}
            }"#,
        )
        .unwrap();

        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0], Target::new("alice", "https://x/stream-1_a.m3u8"));
        assert_eq!(
            targets[1].secondary_url.as_deref(),
            Some("https://x/stream-2_a.flv")
        );
        assert_eq!(targets[2].secondary_url, None);
    }

    #[test]
    fn test_parse_skips_empty_primary() {
        let targets = FileTargetSource::parse(r#"{"a": "", "b": "u"}"#).unwrap();
        assert_eq!(targets, vec![Target::new("b", "u")]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FileTargetSource::parse("[1,2,3]").is_err());
        assert!(FileTargetSource::parse("   ").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let source = FileTargetSource::new(temp.path().join("links.json"));
        assert!(source.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_mirrors_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("links.json");
        tokio::fs::write(&path, r#"{"a": "u1"}"#).await.unwrap();

        let registry = Arc::new(TargetRegistry::new());
        let cancel = CancellationToken::new();
        let handle = spawn_refresh(
            registry.clone(),
            FileTargetSource::new(&path),
            Duration::from_millis(10),
            cancel.clone(),
        );

        for _ in 0..200 {
            if registry.contains("a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.contains("a"));

        tokio::fs::write(&path, "{ not json").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.contains("a"), "parse failure must keep previous set");

        tokio::fs::write(&path, r#"{"b": "u2"}"#).await.unwrap();
        for _ in 0..200 {
            if registry.contains("b") && !registry.contains("a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.contains("b"));
        assert!(!registry.contains("a"));

        cancel.cancel();
        handle.await.unwrap();
    }
}
