//! Runtime configuration.
//!
//! Configuration is a JSON document (every field optional) layered under
//! `LIVE_REC_*` environment variables. Nothing here is reloaded at runtime;
//! the binary loads it once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fallback::RetryConfig;
use crate::recorder::FfmpegConfig;
use crate::{Error, Result};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LIVE_REC_";

/// Default dispatch interval (3 seconds).
const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 3_000;

/// Default registry refresh interval (3 seconds).
const DEFAULT_REGISTRY_REFRESH_MS: u64 = 3_000;

/// Default cap on simultaneous recordings.
const DEFAULT_MAX_CONCURRENT_CAPTURES: usize = 32;

/// Default session id pattern: the numeric id in `.../stream-<digits>_...`.
pub const DEFAULT_SESSION_ID_PATTERN: &str = r"stream-(\d+)_";

/// Top-level configuration for the capture service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory holding one lock marker per recording target.
    pub lock_dir: PathBuf,
    /// Directory holding in-progress fragments, one sub-directory per target.
    pub segments_dir: PathBuf,
    /// Directory receiving consolidated artifacts.
    pub output_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// JSON file written by the resolver: target name -> media URL(s).
    pub targets_file: PathBuf,
    /// Persisted set of targets that fell back to the secondary protocol.
    pub fallback_file: PathBuf,
    /// Externally maintained list of targets that always use the secondary protocol.
    pub always_secondary_file: PathBuf,
    /// Dispatch cycle period in milliseconds.
    pub dispatch_interval_ms: u64,
    /// How often the targets file is re-read, in milliseconds.
    pub registry_refresh_interval_ms: u64,
    /// Maximum number of simultaneous capture workers.
    pub max_concurrent_captures: usize,
    /// Primary-protocol retry policy.
    pub retry: RetryConfig,
    /// Recording tool settings.
    pub recorder: FfmpegConfig,
    /// Regex with one capture group extracting the session id from a media URL.
    pub session_id_pattern: String,
    /// Log filter directive; `RUST_LOG` wins when set.
    pub log_filter: Option<String>,
    /// Days to keep rolled log files.
    pub log_retention_days: i64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            lock_dir: data.join("locks"),
            segments_dir: data.join("segments"),
            output_dir: data.join("videos"),
            log_dir: data.join("logs"),
            targets_file: data.join("stream_links.json"),
            fallback_file: data.join("fallback_targets.txt"),
            always_secondary_file: data.join("always_secondary.txt"),
            dispatch_interval_ms: DEFAULT_DISPATCH_INTERVAL_MS,
            registry_refresh_interval_ms: DEFAULT_REGISTRY_REFRESH_MS,
            max_concurrent_captures: DEFAULT_MAX_CONCURRENT_CAPTURES,
            retry: RetryConfig::default(),
            recorder: FfmpegConfig::default(),
            session_id_pattern: DEFAULT_SESSION_ID_PATTERN.to_string(),
            log_filter: None,
            log_retention_days: 7,
        }
    }
}

impl CaptureConfig {
    /// Load configuration from an optional JSON file plus process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        let config = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply `LIVE_REC_*` overrides using `lookup` to resolve variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(dir) = get("DATA_DIR") {
            let data = PathBuf::from(dir);
            self.lock_dir = data.join("locks");
            self.segments_dir = data.join("segments");
            self.output_dir = data.join("videos");
            self.log_dir = data.join("logs");
            self.targets_file = data.join("stream_links.json");
            self.fallback_file = data.join("fallback_targets.txt");
            self.always_secondary_file = data.join("always_secondary.txt");
        }

        let paths: [(&str, &mut PathBuf); 7] = [
            ("LOCK_DIR", &mut self.lock_dir),
            ("SEGMENTS_DIR", &mut self.segments_dir),
            ("OUTPUT_DIR", &mut self.output_dir),
            ("LOG_DIR", &mut self.log_dir),
            ("TARGETS_FILE", &mut self.targets_file),
            ("FALLBACK_FILE", &mut self.fallback_file),
            ("ALWAYS_SECONDARY_FILE", &mut self.always_secondary_file),
        ];
        for (name, slot) in paths {
            if let Some(value) = get(name) {
                *slot = PathBuf::from(value);
            }
        }

        if let Some(v) = get("FFMPEG_PATH") {
            self.recorder.binary_path = v;
        }
        if let Some(v) = get("DISPATCH_INTERVAL_MS") {
            self.dispatch_interval_ms = parse_number("DISPATCH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("REGISTRY_REFRESH_INTERVAL_MS") {
            self.registry_refresh_interval_ms = parse_number("REGISTRY_REFRESH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_CAPTURES") {
            self.max_concurrent_captures = parse_number("MAX_CONCURRENT_CAPTURES", &v)?;
        }
        if let Some(v) = get("MAX_PRIMARY_ATTEMPTS") {
            self.retry.max_primary_attempts = parse_number("MAX_PRIMARY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_SECS") {
            self.retry.backoff_secs = parse_number("RETRY_BACKOFF_SECS", &v)?;
        }
        if let Some(v) = get("SESSION_ID_PATTERN") {
            self.session_id_pattern = v;
        }
        if let Some(v) = get("LOG_FILTER") {
            self.log_filter = Some(v);
        }

        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(Error::config("dispatch_interval_ms must be greater than 0"));
        }
        if self.registry_refresh_interval_ms == 0 {
            return Err(Error::config(
                "registry_refresh_interval_ms must be greater than 0",
            ));
        }
        if self.max_concurrent_captures == 0 {
            return Err(Error::config("max_concurrent_captures must be greater than 0"));
        }
        if self.retry.max_primary_attempts == 0 {
            return Err(Error::config("retry.max_primary_attempts must be greater than 0"));
        }
        if self.recorder.binary_path.trim().is_empty() {
            return Err(Error::config("recorder.binary_path must not be empty"));
        }
        for (name, ext) in [
            ("primary_container", &self.recorder.primary_container),
            ("secondary_container", &self.recorder.secondary_container),
        ] {
            if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::config(format!(
                    "recorder.{name} must be a bare extension, got {ext:?}"
                )));
            }
        }

        let re = regex::Regex::new(&self.session_id_pattern)
            .map_err(|e| Error::config(format!("invalid session_id_pattern: {e}")))?;
        if re.captures_len() < 2 {
            return Err(Error::config(
                "session_id_pattern must contain a capture group",
            ));
        }

        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn registry_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.registry_refresh_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{ENV_PREFIX}{name} is not a valid number: {value}")))
}
