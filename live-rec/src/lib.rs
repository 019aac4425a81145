//! live-rec library crate.
//!
//! Capture scheduling and consolidation engine: per-target locks, supervised
//! ffmpeg recordings with protocol fallback, and fragment merging. The
//! `live-rec` binary wires these together; everything is exposed here for
//! integration testing and embedding.

pub mod capture;
pub mod config;
pub mod consolidator;
pub mod error;
pub mod events;
pub mod fallback;
pub mod lock;
pub mod logging;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
