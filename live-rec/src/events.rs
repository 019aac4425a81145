//! Capture lifecycle events.
//!
//! Published on a `tokio::sync::broadcast` channel for status tooling. Sends
//! never block and a lagging or absent subscriber never affects capture.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::fallback::Protocol;

/// Default buffer for the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// A worker took the lock and resolved the session.
    SessionStarted {
        target: String,
        session_id: String,
        protocol: Protocol,
    },
    /// One recording attempt failed.
    AttemptFailed {
        target: String,
        session_id: String,
        protocol: Protocol,
        attempt: u32,
        reason: String,
    },
    /// Primary attempts exhausted; the target joined the fallback set.
    SwitchedToSecondary { target: String, session_id: String },
    /// The session ended with at least one artifact.
    SessionCompleted {
        target: String,
        session_id: String,
        artifacts: Vec<PathBuf>,
    },
    /// The session ended without a usable fragment.
    SessionExhausted { target: String, session_id: String },
    /// Fragments could not be merged and were left in place.
    ConsolidationFailed {
        target: String,
        session_id: String,
        fragments: Vec<PathBuf>,
        reason: String,
    },
}

/// Sender half shared by the dispatcher and its workers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CaptureEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.tx.subscribe()
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn emit(&self, event: CaptureEvent) {
        let _ = self.tx.send(event);
    }
}
