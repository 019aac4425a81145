//! Capture workers: one supervised recording session per target.

mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::CaptureConfig;
use crate::consolidator::Consolidator;
use crate::events::EventBus;
use crate::fallback::{FallbackPolicy, FallbackSets};
use crate::lock::LockManager;
use crate::recorder::{FfmpegConfig, Recorder};
use crate::session::SessionIdExtractor;
use crate::Result;

pub use worker::run_capture;

/// Everything a worker needs, shared by all workers.
pub struct CaptureContext {
    pub locks: LockManager,
    pub fallback: Arc<FallbackSets>,
    pub policy: FallbackPolicy,
    pub recorder: Arc<dyn Recorder>,
    pub consolidator: Consolidator,
    pub extractor: SessionIdExtractor,
    pub recorder_config: FfmpegConfig,
    pub segments_dir: PathBuf,
    pub events: EventBus,
}

impl CaptureContext {
    pub fn from_config(
        config: &CaptureConfig,
        locks: LockManager,
        fallback: Arc<FallbackSets>,
        recorder: Arc<dyn Recorder>,
        events: EventBus,
    ) -> Result<Self> {
        let containers = [
            config.recorder.primary_container.clone(),
            config.recorder.secondary_container.clone(),
        ];
        Ok(Self {
            locks,
            fallback,
            policy: FallbackPolicy::new(config.retry.clone()),
            consolidator: Consolidator::new(
                recorder.clone(),
                &config.segments_dir,
                &config.output_dir,
                containers,
            ),
            recorder,
            extractor: SessionIdExtractor::new(&config.session_id_pattern)?,
            recorder_config: config.recorder.clone(),
            segments_dir: config.segments_dir.clone(),
            events,
        })
    }
}

/// How one worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Another worker holds the target's lock; nothing was done.
    LockHeld,
    /// The lock could not be taken for another reason.
    LockError,
    /// At least one artifact was produced.
    Completed {
        session_id: String,
        artifacts: Vec<PathBuf>,
    },
    /// Fragments exist but could not be merged; they were kept.
    ConsolidationFailed { session_id: String },
    /// No attempt produced a usable fragment.
    Exhausted { session_id: String },
}
