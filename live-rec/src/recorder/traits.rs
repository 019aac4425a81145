//! Recorder trait and the types exchanged with it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::progress::Progress;
use crate::Result;
use crate::fallback::Protocol;

/// One recording invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRequest {
    /// Target name, for logging.
    pub target: String,
    /// Session the fragment belongs to.
    pub session_id: String,
    /// Protocol the URL belongs to.
    pub protocol: Protocol,
    /// Input media URL.
    pub url: String,
    /// Fresh fragment path for this attempt.
    pub output: PathBuf,
}

/// How a recording invocation ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordExit {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Last stderr line that looked like an error.
    pub last_error: Option<String>,
    /// Last progress report parsed from stderr.
    pub progress: Option<Progress>,
    /// Wall time the process ran.
    pub elapsed: Duration,
}

impl RecordExit {
    /// Exit with code 0.
    pub fn clean() -> Self {
        Self {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// Exit with the given non-zero code.
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            last_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runtime status of the recording tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
}

/// External recording tool.
///
/// `record` runs until the child exits, which for a live stream may be hours.
/// Spawn failures come back as errors (`ToolUnavailable` when the binary is
/// missing); everything after a successful spawn is reported in [`RecordExit`].
#[async_trait]
pub trait Recorder: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Record `request.url` into `request.output`.
    async fn record(&self, request: &RecordRequest) -> Result<RecordExit>;

    /// Stream-copy concatenate the fragments named in `list_file` into `output`.
    async fn concat(&self, list_file: &Path, output: &Path) -> Result<()>;

    fn is_available(&self) -> bool;

    fn version(&self) -> Option<String>;

    fn status(&self) -> RecorderStatus {
        RecorderStatus {
            name: self.name().to_string(),
            available: self.is_available(),
            version: self.version(),
        }
    }
}
