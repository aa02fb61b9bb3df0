//! Statistics and counters for an engine instance

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live engine counters
///
/// Updated with relaxed atomics from the reader and writer paths; read via
/// `snapshot()`.
#[derive(Debug)]
pub struct EngineStats {
    started_at: Instant,
    /// Bytes received from the transport
    pub bytes_received: AtomicU64,
    /// Bytes written to the transport
    pub bytes_sent: AtomicU64,
    /// Complete frames produced by the framer
    pub frames: AtomicU64,
    /// Commands written
    pub commands_sent: AtomicU64,
    /// Replies matched to a pending command
    pub replies_resolved: AtomicU64,
    /// Callback invocations
    pub deliveries: AtomicU64,
    /// Messages no callback was registered for
    pub unrouted: AtomicU64,
    /// Framing failures (overflow, malformed, encoding)
    pub framing_errors: AtomicU64,
    /// Replies flagged as errors or failing to decode
    pub protocol_errors: AtomicU64,
    /// Subscriptions repaired by resync
    pub drift_repairs: AtomicU64,
    /// Pending commands dropped on disconnect or timeout
    pub abandoned_commands: AtomicU64,
}

/// Point-in-time copy of `EngineStats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub uptime: Duration,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames: u64,
    pub commands_sent: u64,
    pub replies_resolved: u64,
    pub deliveries: u64,
    pub unrouted: u64,
    pub framing_errors: u64,
    pub protocol_errors: u64,
    pub drift_repairs: u64,
    pub abandoned_commands: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            replies_resolved: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            drift_repairs: AtomicU64::new(0),
            abandoned_commands: AtomicU64::new(0),
        }
    }

    /// Add `n` to a counter
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            uptime: self.started_at.elapsed(),
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
            frames: load(&self.frames),
            commands_sent: load(&self.commands_sent),
            replies_resolved: load(&self.replies_resolved),
            deliveries: load(&self.deliveries),
            unrouted: load(&self.unrouted),
            framing_errors: load(&self.framing_errors),
            protocol_errors: load(&self.protocol_errors),
            drift_repairs: load(&self.drift_repairs),
            abandoned_commands: load(&self.abandoned_commands),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStatsSnapshot {
    /// Share of frames that failed to frame or parse, in [0, 1]
    pub fn error_ratio(&self) -> f64 {
        let total = self.frames + self.framing_errors;
        if total > 0 {
            self.framing_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_zeroed() {
        let snapshot = EngineStats::new().snapshot();
        assert_eq!(snapshot.frames, 0);
        assert_eq!(snapshot.commands_sent, 0);
        assert_eq!(snapshot.drift_repairs, 0);
        assert_eq!(snapshot.error_ratio(), 0.0);
    }

    #[test]
    fn test_counters_and_error_ratio() {
        let stats = EngineStats::new();
        EngineStats::add(&stats.frames, 3);
        EngineStats::add(&stats.framing_errors, 1);
        EngineStats::add(&stats.drift_repairs, 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames, 3);
        assert_eq!(snapshot.drift_repairs, 2);
        assert_eq!(snapshot.error_ratio(), 0.25);
    }
}
