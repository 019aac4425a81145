//! Parsing of ffmpeg's stderr status lines.
//!
//! ffmpeg reports progress as
//! `frame=X fps=X q=X size=XkB time=HH:MM:SS.ms bitrate=Xkbits/s speed=Xx`.

use serde::{Deserialize, Serialize};

/// Snapshot of a running recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes written so far.
    pub bytes_written: u64,
    /// Media time recorded, in seconds.
    pub media_secs: f64,
    /// Bitrate in bytes per second.
    pub bytes_per_sec: u64,
}

/// Parse `HH:MM:SS.ms` to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// `size=    1024kB` (also `KiB`) in bytes.
fn parse_size(line: &str) -> Option<u64> {
    let start = line.find("size=")?;
    let rest = line[start + 5..].trim_start();
    let end = rest.find(['k', 'K'])?;
    let kib: u64 = rest[..end].trim().parse().ok()?;
    Some(kib * 1024)
}

fn parse_time_field(line: &str) -> Option<f64> {
    let start = line.find("time=")?;
    let rest = &line[start + 5..];
    let end = rest.find(' ').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

fn parse_bitrate(line: &str) -> Option<u64> {
    let start = line.find("bitrate=")?;
    let rest = &line[start + 8..];
    let end = rest.find("kbits/s")?;
    let kbits: f64 = rest[..end].trim().parse().ok()?;
    Some((kbits * 1024.0 / 8.0) as u64)
}

/// Parse a progress line; `None` for anything else.
pub fn parse_progress(line: &str) -> Option<Progress> {
    if !line.contains("time=") || !(line.contains("frame=") || line.contains("size=")) {
        return None;
    }

    Some(Progress {
        bytes_written: parse_size(line).unwrap_or(0),
        media_secs: parse_time_field(line).unwrap_or(0.0),
        bytes_per_sec: parse_bitrate(line).unwrap_or(0),
    })
}

/// Whether a stderr line reports an error.
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error")
        || lower.contains("failed")
        || lower.contains("invalid data")
        || lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("not found")
}
