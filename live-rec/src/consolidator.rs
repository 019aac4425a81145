//! Segment consolidation: one session's fragments into final artifacts.
//!
//! Fragments are grouped by container. Each group becomes one artifact: a
//! single fragment is moved as-is, several are stream-copy concatenated in
//! filename order. A session that used both protocols therefore yields one
//! artifact per container instead of a mixed-container merge.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::recorder::{Recorder, render_concat_list};
use crate::session::{artifact_path, fragment_dir, fragment_prefix};
use crate::utils::fs;
use crate::{Error, Result};

/// A container group that could not be merged.
#[derive(Debug, Clone)]
pub struct MergeFailure {
    pub container: String,
    /// Fragments left in place for manual recovery.
    pub fragments: Vec<PathBuf>,
    pub message: String,
}

/// Result of consolidating one session.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    /// Final artifacts written, one per container.
    pub artifacts: Vec<PathBuf>,
    pub failures: Vec<MergeFailure>,
}

impl ConsolidationReport {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.failures.is_empty()
    }
}

pub struct Consolidator {
    recorder: Arc<dyn Recorder>,
    segments_dir: PathBuf,
    output_dir: PathBuf,
    containers: Vec<String>,
}

impl Consolidator {
    /// `containers` are the fragment extensions that belong to a session.
    pub fn new(
        recorder: Arc<dyn Recorder>,
        segments_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        containers: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut containers: Vec<String> = containers.into_iter().collect();
        containers.sort();
        containers.dedup();
        Self {
            recorder,
            segments_dir: segments_dir.into(),
            output_dir: output_dir.into(),
            containers,
        }
    }

    /// Non-empty fragments of a session, sorted by filename.
    pub async fn list_fragments(&self, target: &str, session_id: &str) -> Result<Vec<PathBuf>> {
        let dir = fragment_dir(&self.segments_dir, target);
        let prefix = fragment_prefix(target, session_id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_path("listing fragments", &dir, e)),
        };

        let mut fragments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("listing fragments", &dir, e))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || self.container_of(&path).is_none() {
                continue;
            }
            match fs::file_size(&path).await {
                Some(size) if size > 0 => fragments.push(path),
                Some(_) => debug!(path = %path.display(), "Ignoring empty fragment"),
                None => {}
            }
        }

        fragments.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(fragments)
    }

    fn container_of(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?;
        self.containers
            .iter()
            .find(|c| c.eq_ignore_ascii_case(ext))
            .cloned()
    }

    /// Merge every fragment of `(target, session_id)` into final artifacts.
    ///
    /// Merge failures are reported in the returned report, not as an error;
    /// their fragments stay where they are.
    pub async fn consolidate(&self, target: &str, session_id: &str) -> Result<ConsolidationReport> {
        let fragments = self.list_fragments(target, session_id).await?;
        let mut report = ConsolidationReport::default();

        if fragments.is_empty() {
            info!(target_name = %target, session_id = %session_id, "No fragments to consolidate");
            return Ok(report);
        }

        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in fragments {
            if let Some(container) = self.container_of(&path) {
                groups.entry(container).or_default().push(path);
            }
        }
        if groups.len() > 1 {
            warn!(
                target_name = %target,
                session_id = %session_id,
                containers = ?groups.keys().collect::<Vec<_>>(),
                "Session has mixed containers, producing one artifact per container"
            );
        }

        fs::ensure_dir_all_with_op("creating output directory", &self.output_dir).await?;

        for (container, group) in groups {
            match self.consolidate_group(target, session_id, &container, &group).await {
                Ok(artifact) => {
                    info!(
                        target_name = %target,
                        session_id = %session_id,
                        fragments = group.len(),
                        artifact = %artifact.display(),
                        "Session consolidated"
                    );
                    report.artifacts.push(artifact);
                }
                Err(e) => {
                    error!(
                        target_name = %target,
                        session_id = %session_id,
                        container = %container,
                        error = %e,
                        "Consolidation failed, fragments kept for manual recovery"
                    );
                    report.failures.push(MergeFailure {
                        container,
                        fragments: group,
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn consolidate_group(
        &self,
        target: &str,
        session_id: &str,
        container: &str,
        fragments: &[PathBuf],
    ) -> Result<PathBuf> {
        let artifact = artifact_path(&self.output_dir, target, session_id, container, Local::now());

        if let [single] = fragments {
            fs::move_file(single, &artifact).await?;
            return Ok(artifact);
        }

        let list_file = fragment_dir(&self.segments_dir, target).join(format!(
            "{}{container}.concat.txt",
            fragment_prefix(target, session_id)
        ));
        // The concat demuxer resolves relative entries against the list's own
        // directory, not the working directory.
        let mut entries = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            entries.push(fs::make_absolute(fragment).await);
        }
        let body = render_concat_list(entries.iter().map(PathBuf::as_path));
        tokio::fs::write(&list_file, body)
            .await
            .map_err(|e| Error::io_path("writing concat list", &list_file, e))?;

        let merged = self.recorder.concat(&list_file, &artifact).await;
        if let Err(e) = fs::remove_file_if_exists(&list_file).await {
            warn!(error = %e, "Failed to remove concat list");
        }

        if let Err(e) = merged {
            discard_partial(&artifact).await;
            return Err(Error::merge(session_id, e.to_string()));
        }
        if fs::file_size(&artifact).await.unwrap_or(0) == 0 {
            discard_partial(&artifact).await;
            return Err(Error::merge(session_id, "merged artifact is empty"));
        }

        for fragment in fragments {
            if let Err(e) = fs::remove_file_if_exists(fragment).await {
                warn!(path = %fragment.display(), error = %e, "Failed to delete merged fragment");
            }
        }
        Ok(artifact)
    }
}

async fn discard_partial(artifact: &Path) {
    if let Err(e) = fs::remove_file_if_exists(artifact).await {
        warn!(path = %artifact.display(), error = %e, "Failed to remove partial artifact");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::test_support::{FakeAttempt, FakeRecorder};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        segments: PathBuf,
        output: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let segments = temp.path().join("segments");
            let output = temp.path().join("videos");
            Self {
                _temp: temp,
                segments,
                output,
            }
        }

        fn consolidator(&self, recorder: FakeRecorder) -> Consolidator {
            Consolidator::new(
                Arc::new(recorder),
                &self.segments,
                &self.output,
                ["mp4".to_string(), "flv".to_string()],
            )
        }

        fn fragment(&self, name: &str, bytes: &[u8]) -> PathBuf {
            let dir = self.segments.join("A");
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            std::fs::write(&path, bytes).unwrap();
            path
        }

        fn outputs(&self) -> Vec<PathBuf> {
            let mut out: Vec<PathBuf> = std::fs::read_dir(&self.output)
                .map(|rd| rd.flatten().map(|e| e.path()).collect())
                .unwrap_or_default();
            out.sort();
            out
        }
    }

    /// `path` spelled relative to the working directory.
    #[cfg(unix)]
    fn relative_to_cwd(path: &Path) -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        let mut relative: PathBuf = cwd.components().skip(1).map(|_| "..").collect();
        relative.push(path.strip_prefix("/").unwrap());
        relative
    }

    fn recorder() -> FakeRecorder {
        FakeRecorder::new([], FakeAttempt::Fail(Vec::new()))
    }

    #[tokio::test]
    async fn test_zero_fragments_writes_nothing() {
        let fx = Fixture::new();
        let report = fx.consolidator(recorder()).consolidate("A", "123").await.unwrap();

        assert!(report.is_empty());
        assert!(!fx.output.exists());
        assert!(!fx.segments.exists());
    }

    #[tokio::test]
    async fn test_single_fragment_is_moved_byte_identical() {
        let fx = Fixture::new();
        let fragment = fx.fragment("A_123_t1.mp4", b"\x00\x01single");

        let report = fx.consolidator(recorder()).consolidate("A", "123").await.unwrap();

        assert_eq!(report.artifacts.len(), 1);
        let artifact = &report.artifacts[0];
        assert_eq!(std::fs::read(artifact).unwrap(), b"\x00\x01single");
        assert!(!fragment.exists());
        let name = artifact.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("A_123_") && name.ends_with(".mp4"), "{name}");
    }

    #[tokio::test]
    async fn test_multi_fragment_merge_in_filename_order() {
        let fx = Fixture::new();
        // Created out of order on purpose.
        fx.fragment("A_123_t3.mp4", b"three");
        fx.fragment("A_123_t1.mp4", b"one-");
        fx.fragment("A_123_t2.mp4", b"two-");
        fx.fragment("A_999_t1.mp4", b"other session");

        let report = fx.consolidator(recorder()).consolidate("A", "123").await.unwrap();

        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(std::fs::read(&report.artifacts[0]).unwrap(), b"one-two-three");

        let left: Vec<String> = std::fs::read_dir(fx.segments.join("A"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec!["A_999_t1.mp4"]);
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_fragments() {
        let fx = Fixture::new();
        let a = fx.fragment("A_123_t1.mp4", b"a");
        let b = fx.fragment("A_123_t2.mp4", b"b");

        let report = fx
            .consolidator(recorder().failing_concat())
            .consolidate("A", "123")
            .await
            .unwrap();

        assert!(report.artifacts.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].fragments, vec![a.clone(), b.clone()]);
        assert!(a.exists() && b.exists());
        assert!(fx.outputs().is_empty());
        let concat_lists = std::fs::read_dir(fx.segments.join("A"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".concat.txt"))
            .count();
        assert_eq!(concat_lists, 0);
    }

    #[tokio::test]
    async fn test_mixed_containers_yield_one_artifact_each() {
        let fx = Fixture::new();
        fx.fragment("A_123_t1.mp4", b"p1-");
        fx.fragment("A_123_t2.mp4", b"p2");
        fx.fragment("A_123_t3.flv", b"s1");

        let report = fx.consolidator(recorder()).consolidate("A", "123").await.unwrap();

        assert_eq!(report.artifacts.len(), 2);
        let outputs = fx.outputs();
        let flv = outputs.iter().find(|p| p.extension().unwrap() == "flv").unwrap();
        let mp4 = outputs.iter().find(|p| p.extension().unwrap() == "mp4").unwrap();
        assert_eq!(std::fs::read(flv).unwrap(), b"s1");
        assert_eq!(std::fs::read(mp4).unwrap(), b"p1-p2");
    }

    #[tokio::test]
    async fn test_empty_and_foreign_files_are_ignored() {
        let fx = Fixture::new();
        fx.fragment("A_123_t1.mp4", b"");
        fx.fragment("A_123_t2.part", b"junk");

        let fragments = fx
            .consolidator(recorder())
            .list_fragments("A", "123")
            .await
            .unwrap();
        assert!(fragments.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relative_segments_dir_still_merges() {
        let fx = Fixture::new();
        fx.fragment("A_123_t1.mp4", b"one-");
        fx.fragment("A_123_t2.mp4", b"two");
        let segments = relative_to_cwd(&fx.segments);
        assert!(segments.is_relative());

        let consolidator = Consolidator::new(
            Arc::new(recorder()),
            segments,
            relative_to_cwd(&fx.output),
            ["mp4".to_string()],
        );
        let report = consolidator.consolidate("A", "123").await.unwrap();

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(std::fs::read(&report.artifacts[0]).unwrap(), b"one-two");
    }
}
