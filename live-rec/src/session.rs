//! Session identity and fragment naming.
//!
//! Fragments live in `<segments_dir>/<target>/` and are named
//! `<target>_<session>_<YYYY-MM-DD_HH-MM-SS-mmm>.<ext>`, so a plain filename
//! sort orders a session's fragments by capture start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use regex::Regex;
use tracing::warn;
use uuid::Uuid;

use crate::utils::filename::{sanitize_component, target_key};
use crate::{Error, Result};

/// Timestamp embedded in fragment names.
const FRAGMENT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%3f";

/// Timestamp embedded in artifact names.
const ARTIFACT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Pulls the stream's session id out of a media URL.
#[derive(Debug, Clone)]
pub struct SessionIdExtractor {
    pattern: Regex,
}

impl SessionIdExtractor {
    /// `pattern` must have at least one capture group; group 1 is the id.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid session id pattern: {e}")))?;
        if pattern.captures_len() < 2 {
            return Err(Error::config("session id pattern needs a capture group"));
        }
        Ok(Self { pattern })
    }

    /// The id embedded in `url`, if the pattern matches.
    pub fn extract(&self, url: &str) -> Option<String> {
        self.pattern
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|id| !id.is_empty())
            .map(normalize_session_id)
    }
}

/// Session ids are embedded between `_` separators, so they may not contain one.
fn normalize_session_id(raw: &str) -> String {
    sanitize_component(raw).replace('_', "-")
}

/// Id for a session whose URL carried none.
pub fn generated_session_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("gen-{}", &id[..12])
}

/// A recording session for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub target: String,
    pub id: String,
    /// `true` when the id was generated rather than read from the URL.
    pub generated: bool,
}

impl Session {
    /// Resolve the session for `target` from the first URL that yields an id.
    pub fn resolve<'a>(
        extractor: &SessionIdExtractor,
        target: &str,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        match urls.into_iter().find_map(|url| extractor.extract(url)) {
            Some(id) => Self {
                target: target.to_string(),
                id,
                generated: false,
            },
            None => {
                let id = generated_session_id();
                warn!(
                    target_name = %target,
                    session_id = %id,
                    "No session id in media URL, using a generated one"
                );
                Self {
                    target: target.to_string(),
                    id,
                    generated: true,
                }
            }
        }
    }
}

/// Directory holding `target`'s fragments.
pub fn fragment_dir(segments_root: &Path, target: &str) -> PathBuf {
    segments_root.join(target_key(target))
}

/// Filename prefix shared by every fragment of one session.
pub fn fragment_prefix(target: &str, session_id: &str) -> String {
    format!("{}_{}_", target_key(target), session_id)
}

/// Path for a new fragment started at `at`.
///
/// Never returns a path that already exists; a clash within the same
/// millisecond gets a numeric suffix that still sorts after the original.
pub fn new_fragment_path(
    segments_root: &Path,
    target: &str,
    session_id: &str,
    ext: &str,
    at: DateTime<Local>,
) -> PathBuf {
    let dir = fragment_dir(segments_root, target);
    let stem = format!(
        "{}{}",
        fragment_prefix(target, session_id),
        at.format(FRAGMENT_TIME_FORMAT)
    );
    unique_path(&dir, &stem, ext)
}

/// Path for a consolidated artifact finished at `at`.
pub fn artifact_path(
    output_dir: &Path,
    target: &str,
    session_id: &str,
    ext: &str,
    at: DateTime<Local>,
) -> PathBuf {
    let stem = format!(
        "{}{}",
        fragment_prefix(target, session_id),
        at.format(ARTIFACT_TIME_FORMAT)
    );
    unique_path(output_dir, &stem, ext)
}

fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|n| dir.join(format!("{stem}_{n:03}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
