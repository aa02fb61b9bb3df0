//! Call session tracking
//!
//! Builds a keyed collection of call state machines on top of the feedback
//! registry.

pub mod config;
pub mod names;
pub mod state;
pub mod tracker;

pub use config::{CallTrackerConfig, JoinCommandFn};
pub use names::{Clock, ManualClock, NameCache, SystemClock};
pub use state::{CallDirection, CallRecord, CallStatus};
pub use tracker::{CallEvent, CallTracker};
