//! Subscription drift detection
//!
//! Endpoints can silently drop push subscriptions (buffer overflow, restart,
//! firmware quirks). On a fixed interval the monitor asks the endpoint for
//! its list of active subscriptions under a reserved correlation id, and
//! re-subscribes every key the registry expects but the endpoint no longer
//! reports. Re-subscribing an active key is harmless on the endpoint side,
//! so repair is idempotent.
//!
//! ```text
//!            resume()              tick: list cmd
//!  Suspended ────────► Idle ──────────────────────► Probing
//!      ▲                ▲                              │
//!      │ suspend()      └──── reply: re-subscribe ─────┘
//!      └──────────────────── (any state)                 expected − reported
//! ```

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::protocol::{FeedbackKey, Message};
use crate::registry::FeedbackRegistry;

/// Correlation id reserved for subscription list probes
pub const RESYNC_CORRELATION_ID: &str = "resync";

/// Monitor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncState {
    /// Transport offline; no probes are sent
    Suspended,
    /// Waiting for the next tick
    Idle,
    /// Probe sent, waiting for the subscription list
    Probing { since: Instant },
}

/// Periodic subscription reconciliation
#[derive(Debug)]
pub struct ResyncMonitor {
    state: Mutex<ResyncState>,
    enabled: bool,
}

impl ResyncMonitor {
    /// Create a suspended monitor
    pub fn new(enabled: bool) -> Self {
        Self {
            state: Mutex::new(ResyncState::Suspended),
            enabled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> ResyncState {
        *self.lock()
    }

    /// Whether probes are sent at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Transport came online
    pub fn resume(&self) {
        let mut state = self.lock();
        if *state == ResyncState::Suspended {
            *state = ResyncState::Idle;
        }
    }

    /// Transport went offline; any outstanding probe is forgotten
    pub fn suspend(&self) {
        *self.lock() = ResyncState::Suspended;
    }

    /// Enter `Probing` if a probe may be sent now
    pub fn begin_probe(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.lock();
        match *state {
            ResyncState::Suspended => false,
            ResyncState::Probing { since } => {
                tracing::debug!(
                    waited_ms = since.elapsed().as_millis() as u64,
                    "Previous resync probe unanswered, probing again"
                );
                *state = ResyncState::Probing {
                    since: Instant::now(),
                };
                true
            }
            ResyncState::Idle => {
                *state = ResyncState::Probing {
                    since: Instant::now(),
                };
                true
            }
        }
    }

    /// Return to `Idle` after a failed probe
    pub fn abort_probe(&self) {
        let mut state = self.lock();
        if matches!(*state, ResyncState::Probing { .. }) {
            *state = ResyncState::Idle;
        }
    }

    /// Whether a message is the reply to a probe
    pub fn is_probe_reply(&self, message: &Message) -> bool {
        message.correlation_id.as_deref() == Some(RESYNC_CORRELATION_ID)
    }

    /// Reconcile the endpoint's reported subscriptions with the registry
    ///
    /// Re-subscribes every missing key and returns them. A reply that
    /// arrives while no probe is outstanding is ignored.
    pub fn complete(
        &self,
        registry: &FeedbackRegistry,
        reported: &[FeedbackKey],
    ) -> Vec<FeedbackKey> {
        {
            let mut state = self.lock();
            if !matches!(*state, ResyncState::Probing { .. }) {
                tracing::debug!(state = ?*state, "Ignoring unexpected resync reply");
                return Vec::new();
            }
            *state = ResyncState::Idle;
        }

        let missing = missing_subscriptions(&registry.remote_keys(), reported);
        let mut repaired = Vec::with_capacity(missing.len());
        for key in missing {
            if registry.resubscribe(&key) {
                tracing::warn!(key = %key, "Subscription drift repaired");
                repaired.push(key);
            }
        }

        tracing::debug!(
            reported = reported.len(),
            repaired = repaired.len(),
            "Resync complete"
        );
        repaired
    }
}

/// Keys in `expected` that are absent from `reported`, in `expected` order
pub fn missing_subscriptions(expected: &[FeedbackKey], reported: &[FeedbackKey]) -> Vec<FeedbackKey> {
    let reported: HashSet<&FeedbackKey> = reported.iter().collect();
    expected
        .iter()
        .filter(|k| !reported.contains(k))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{Payload, XapiProtocol, XmlNode};
    use crate::testing::RecordingSink;

    fn keys(paths: &[&str]) -> Vec<FeedbackKey> {
        paths.iter().map(|p| FeedbackKey::parse(p)).collect()
    }

    #[test]
    fn test_missing_subscriptions() {
        let expected = keys(&["event/a", "event/b", "event/c"]);
        let reported = keys(&["/Event/A", "/Event/C", "/Event/Z"]);
        assert_eq!(missing_subscriptions(&expected, &reported), keys(&["event/b"]));
    }

    #[test]
    fn test_state_machine() {
        let monitor = ResyncMonitor::new(true);
        assert_eq!(monitor.state(), ResyncState::Suspended);
        assert!(!monitor.begin_probe());

        monitor.resume();
        assert_eq!(monitor.state(), ResyncState::Idle);
        assert!(monitor.begin_probe());
        assert!(matches!(monitor.state(), ResyncState::Probing { .. }));

        monitor.abort_probe();
        assert_eq!(monitor.state(), ResyncState::Idle);

        monitor.suspend();
        assert_eq!(monitor.state(), ResyncState::Suspended);
    }

    #[test]
    fn test_disabled_never_probes() {
        let monitor = ResyncMonitor::new(false);
        monitor.resume();
        assert!(!monitor.begin_probe());
    }

    #[test]
    fn test_complete_resubscribes_only_missing() {
        let sink = Arc::new(RecordingSink::new());
        let registry = FeedbackRegistry::new(Arc::new(XapiProtocol::new()), sink.clone(), "codec");
        for key in keys(&["event/a", "event/b", "event/c"]) {
            registry.register(&key, |_| {});
        }
        sink.take();

        let monitor = ResyncMonitor::new(true);
        monitor.resume();
        assert!(monitor.begin_probe());

        let repaired = monitor.complete(&registry, &keys(&["event/a", "event/c"]));
        assert_eq!(repaired, keys(&["event/b"]));
        assert_eq!(sink.take(), vec!["xFeedback register /event/b"]);
        assert_eq!(monitor.state(), ResyncState::Idle);

        // Late duplicate reply is ignored
        assert!(monitor.complete(&registry, &[]).is_empty());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_probe_reply_detection() {
        let monitor = ResyncMonitor::new(true);
        let reply = Message::new(Payload::Xml(XmlNode::new("XmlDoc")))
            .with_correlation_id(RESYNC_CORRELATION_ID);
        assert!(monitor.is_probe_reply(&reply));
        assert!(!monitor.is_probe_reply(&reply.clone().with_correlation_id("7")));
    }
}
