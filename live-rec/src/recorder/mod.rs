//! External recording tool.
//!
//! The engine only needs two operations from the tool: record one URL into
//! one fragment file, and stream-copy concatenate a list of fragments.

mod ffmpeg;
mod progress;
mod traits;

use std::path::{Path, PathBuf};

pub use ffmpeg::{FfmpegConfig, FfmpegRecorder};
pub use progress::{Progress, parse_progress};
pub use traits::{RecordExit, RecordRequest, Recorder, RecorderStatus};

/// One `file '<path>'` line of an ffmpeg concat list.
///
/// Single quotes inside the path are closed, escaped and reopened.
pub fn concat_list_entry(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{escaped}'")
}

/// Render a concat list for `paths`, in order.
pub fn render_concat_list<'a>(paths: impl IntoIterator<Item = &'a Path>) -> String {
    let mut body = String::new();
    for path in paths {
        body.push_str(&concat_list_entry(path));
        body.push('\n');
    }
    body
}

/// Paths named by a concat list, in order.
pub fn parse_concat_list(raw: &str) -> Vec<PathBuf> {
    raw.lines()
        .filter_map(|line| {
            let quoted = line.trim().strip_prefix("file ")?.trim();
            let inner = quoted.strip_prefix('\'')?.strip_suffix('\'')?;
            Some(PathBuf::from(inner.replace(r"'\''", "'")))
        })
        .collect()
}
