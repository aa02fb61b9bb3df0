//! Per-endpoint protocol engine
//!
//! One [`Engine`] per codec connection. It frames inbound bytes, correlates
//! replies, dispatches feedback through the registry and keeps subscriptions
//! honest with the resync monitor.

pub mod config;
pub mod core;
pub mod resync;

pub use self::config::{EngineConfig, MIN_RESYNC_INTERVAL};
pub use self::core::{ConnectionObserver, Engine};
pub use self::resync::{missing_subscriptions, ResyncMonitor, ResyncState, RESYNC_CORRELATION_ID};
