//! Statistics for the feedback engine

pub mod metrics;

pub use metrics::{EngineStats, EngineStatsSnapshot};
