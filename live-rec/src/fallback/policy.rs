//! Retry and protocol-fallback decisions for one capture session.
//!
//! The policy is a pure state machine: the worker asks [`FallbackPolicy::next`]
//! what to do, performs it, and feeds the result back through
//! [`CaptureState::record`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol used for a recording attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// The target's primary media URL.
    Primary,
    /// The target's secondary media URL.
    Secondary,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary-protocol retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts on the primary protocol before falling back.
    pub max_primary_attempts: u32,
    /// Fixed pause between attempts, in seconds.
    pub backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_primary_attempts: 12,
            backoff_secs: 10,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// What the worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run one recording attempt on `protocol` after waiting `delay`.
    Attempt { protocol: Protocol, delay: Duration },
    /// Primary is exhausted and a secondary URL exists: remember the target
    /// as a fallback member and continue on the secondary protocol.
    SwitchToSecondary,
    /// The session is over.
    Finish,
}

/// Attempt bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct CaptureState {
    protocol: Protocol,
    has_secondary: bool,
    primary_failures: u32,
    secondary_attempts: u32,
    last_succeeded: bool,
}

impl CaptureState {
    pub fn new(initial: Protocol, has_secondary: bool) -> Self {
        Self {
            protocol: initial,
            has_secondary,
            primary_failures: 0,
            secondary_attempts: 0,
            last_succeeded: false,
        }
    }

    /// Record the outcome of the attempt just made on the current protocol.
    pub fn record(&mut self, succeeded: bool) {
        match self.protocol {
            Protocol::Primary if !succeeded => self.primary_failures += 1,
            Protocol::Primary => {}
            Protocol::Secondary => self.secondary_attempts += 1,
        }
        self.last_succeeded = succeeded;
    }

    /// Continue on the secondary protocol.
    pub fn switch_to_secondary(&mut self) {
        self.protocol = Protocol::Secondary;
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn primary_failures(&self) -> u32 {
        self.primary_failures
    }

    pub fn secondary_attempts(&self) -> u32 {
        self.secondary_attempts
    }

    pub fn last_succeeded(&self) -> bool {
        self.last_succeeded
    }

    fn attempts_made(&self) -> u32 {
        self.primary_failures + self.secondary_attempts
    }
}

/// Fixed-bound retry with a single secondary-protocol attempt.
#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    config: RetryConfig,
}

impl FallbackPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn next(&self, state: &CaptureState) -> Decision {
        if state.last_succeeded {
            return Decision::Finish;
        }

        let delay = if state.attempts_made() == 0 {
            Duration::ZERO
        } else {
            self.config.backoff()
        };

        match state.protocol {
            Protocol::Primary if state.primary_failures < self.config.max_primary_attempts => {
                Decision::Attempt {
                    protocol: Protocol::Primary,
                    delay,
                }
            }
            Protocol::Primary if state.has_secondary => Decision::SwitchToSecondary,
            Protocol::Primary => Decision::Finish,
            Protocol::Secondary if state.has_secondary && state.secondary_attempts == 0 => {
                Decision::Attempt {
                    protocol: Protocol::Secondary,
                    delay,
                }
            }
            Protocol::Secondary => Decision::Finish,
        }
    }
}
