//! Request/reply correlation
//!
//! Every outbound command gets a process-unique id which the endpoint echoes
//! in its reply. Replies whose id matches a pending command resolve it;
//! everything else is treated as unsolicited feedback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Process-wide id source, shared by every correlator
static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// An outbound command awaiting its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// Correlation id embedded in the wire text
    pub id: String,
    /// Command text as given by the caller
    pub command: String,
    /// When the command was written
    pub sent_at: Instant,
}

/// Tracks pending commands by correlation id
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingCommand>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a fresh, process-unique correlation id
    pub fn next_id(&self) -> String {
        NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Record a command as sent under `id`
    pub fn track(&self, id: impl Into<String>, command: impl Into<String>) -> PendingCommand {
        let pending = PendingCommand {
            id: id.into(),
            command: command.into(),
            sent_at: Instant::now(),
        };
        self.pending().insert(pending.id.clone(), pending.clone());
        pending
    }

    /// Resolve and remove the pending command for `id`
    pub fn resolve(&self, id: &str) -> Option<PendingCommand> {
        let resolved = self.pending().remove(id);
        if let Some(ref cmd) = resolved {
            tracing::debug!(
                id = %cmd.id,
                command = %cmd.command,
                elapsed_ms = cmd.sent_at.elapsed().as_millis() as u64,
                "Reply resolved"
            );
        }
        resolved
    }

    /// Whether `id` is still awaiting a reply
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending().contains_key(id)
    }

    /// Number of commands awaiting replies
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Drop every pending command (connection lost, no retry)
    pub fn abandon_all(&self) -> Vec<PendingCommand> {
        let abandoned: Vec<PendingCommand> = self.pending().drain().map(|(_, c)| c).collect();
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "Abandoned pending commands");
        }
        abandoned
    }

    /// Drop pending commands older than `max_age`
    pub fn expire(&self, max_age: Duration) -> Vec<PendingCommand> {
        let now = Instant::now();
        let mut pending = self.pending();

        let stale: Vec<String> = pending
            .values()
            .filter(|c| now.duration_since(c.sent_at) > max_age)
            .map(|c| c.id.clone())
            .collect();

        let expired: Vec<PendingCommand> = stale
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect();
        drop(pending);

        for cmd in &expired {
            tracing::warn!(id = %cmd.id, command = %cmd.command, "Command expired without reply");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique_across_correlators() {
        let a = Correlator::new();
        let b = Correlator::new();
        let ids = [a.next_id(), b.next_id(), a.next_id()];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn test_track_and_resolve() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        correlator.track(id.clone(), "xStatus Call");

        assert!(correlator.is_pending(&id));
        let resolved = correlator.resolve(&id).unwrap();
        assert_eq!(resolved.command, "xStatus Call");

        // Second resolution is a miss, not an error
        assert!(correlator.resolve(&id).is_none());
        assert!(correlator.resolve("unknown").is_none());
    }

    #[test]
    fn test_abandon_all() {
        let correlator = Correlator::new();
        correlator.track("a", "one");
        correlator.track("b", "two");

        let mut abandoned: Vec<String> =
            correlator.abandon_all().into_iter().map(|c| c.id).collect();
        abandoned.sort();
        assert_eq!(abandoned, vec!["a", "b"]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_expire() {
        let correlator = Correlator::new();
        correlator.track("old", "one");
        std::thread::sleep(Duration::from_millis(20));
        correlator.track("new", "two");

        let expired = correlator.expire(Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert!(correlator.is_pending("new"));
    }
}
