//! Feedback registry implementation
//!
//! The central map from feedback key to callbacks. Registration is
//! reference-counted per key: the endpoint is asked to push a key when its
//! first remote callback arrives and told to stop when the last one leaves.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::{FeedbackKey, Message, Protocol};

use super::entry::{Callback, CallbackId, Feedback, Interest, Subscription, SubscriptionStats};
use super::CommandSink;

/// Central registry for feedback subscriptions
///
/// All mutation happens under one lock. Commands triggered by a mutation are
/// written while the lock is held, so the wire order of subscribe and
/// unsubscribe always matches the order of registrations. Callbacks are
/// invoked after the lock is released and may re-enter the registry.
pub struct FeedbackRegistry {
    /// Map of key to subscription
    subscriptions: Mutex<HashMap<FeedbackKey, Subscription>>,

    /// Protocol used to build commands and route messages
    protocol: Arc<dyn Protocol>,

    /// Where subscribe/unsubscribe/prime commands go
    sink: Arc<dyn CommandSink>,

    /// Label passed to callbacks as the feedback source
    source: String,

    next_callback_id: AtomicU64,
}

impl FeedbackRegistry {
    /// Create an empty registry
    pub fn new(
        protocol: Arc<dyn Protocol>,
        sink: Arc<dyn CommandSink>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            protocol,
            sink,
            source: source.into(),
            next_callback_id: AtomicU64::new(1),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<FeedbackKey, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, command: String) {
        if let Err(e) = self.sink.send_command(&command) {
            tracing::debug!(command = %command, error = %e, "Registry command not sent");
        }
    }

    /// Register a callback for endpoint-pushed feedback under `key`
    ///
    /// The first remote callback for a key subscribes it on the endpoint and,
    /// for status-class keys, queries the current value so the consumer is
    /// primed without waiting for the next change.
    pub fn register<F>(&self, key: &FeedbackKey, callback: F) -> CallbackId
    where
        F: Fn(&Feedback<'_>) + Send + Sync + 'static,
    {
        self.add(key, Interest::Remote, Arc::new(callback))
    }

    /// Register a callback for locally routed messages (command replies)
    ///
    /// Never emits subscribe/unsubscribe commands and is not part of the
    /// resync expected set.
    pub fn listen<F>(&self, key: &FeedbackKey, callback: F) -> CallbackId
    where
        F: Fn(&Feedback<'_>) + Send + Sync + 'static,
    {
        self.add(key, Interest::Local, Arc::new(callback))
    }

    fn add(&self, key: &FeedbackKey, interest: Interest, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscriptions();

        let entry = subs
            .entry(key.clone())
            .or_insert_with(|| Subscription::new(key.clone()));
        let was_remote = entry.is_remote();
        entry.add(id, interest, callback);

        tracing::debug!(
            key = %key,
            callback = %id,
            interest = ?interest,
            callbacks = entry.callback_count(),
            "Callback registered"
        );

        if interest == Interest::Remote && !was_remote {
            tracing::info!(key = %key, "Subscribing");
            self.send(self.protocol.subscribe_command(key));
            if let Some(prime) = self.protocol.prime_command(key) {
                self.send(prime);
            }
        }

        id
    }

    /// Remove a callback; the last remote callback unsubscribes the key
    ///
    /// Returns false if the callback was not registered under `key`.
    pub fn deregister(&self, key: &FeedbackKey, id: CallbackId) -> bool {
        let mut subs = self.subscriptions();

        let Some(entry) = subs.get_mut(key) else {
            return false;
        };
        let Some(interest) = entry.remove(id) else {
            return false;
        };

        let now_remote = entry.is_remote();
        let now_empty = entry.is_empty();

        if now_empty {
            subs.remove(key);
        }

        tracing::debug!(key = %key, callback = %id, "Callback deregistered");

        if interest == Interest::Remote && !now_remote {
            tracing::info!(key = %key, "Unsubscribing");
            self.send(self.protocol.unsubscribe_command(key));
        }

        true
    }

    /// Route a message to every callback registered for the keys it carries
    ///
    /// Keys nobody registered are dropped silently. A panicking callback is
    /// logged and does not prevent delivery to the others. Returns the number
    /// of callback invocations.
    pub fn dispatch(&self, message: &Message) -> usize {
        let deliveries = {
            let mut subs = self.subscriptions();
            let routes = self
                .protocol
                .route(message, &|key: &FeedbackKey| subs.contains_key(key));

            routes
                .into_iter()
                .filter_map(|route| {
                    let entry = subs.get_mut(&route.key)?;
                    entry.delivered += 1;
                    Some((route, entry.snapshot()))
                })
                .collect::<Vec<_>>()
        };

        let mut invoked = 0;
        for (route, callbacks) in &deliveries {
            let feedback = Feedback {
                source: &self.source,
                key: &route.key,
                correlation_id: message.correlation_id.as_deref(),
                status: &message.status,
                payload: &route.payload,
            };

            for (id, callback) in callbacks {
                let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&feedback)));
                if result.is_err() {
                    tracing::error!(key = %route.key, callback = %id, "Feedback callback panicked");
                }
                invoked += 1;
            }
        }

        invoked
    }

    /// Ask the endpoint to push `key` again, if anyone still wants it
    ///
    /// Returns false if the key has no remote callbacks.
    pub fn resubscribe(&self, key: &FeedbackKey) -> bool {
        let subs = self.subscriptions();
        match subs.get(key) {
            Some(entry) if entry.is_remote() => {
                self.send(self.protocol.subscribe_command(key));
                true
            }
            _ => false,
        }
    }

    /// Re-issue subscribe (and prime) for every remote key
    ///
    /// Used after reconnect, when no endpoint-side state can be assumed.
    pub fn replay(&self) -> usize {
        let subs = self.subscriptions();
        let mut keys: Vec<&FeedbackKey> = subs
            .values()
            .filter(|s| s.is_remote())
            .map(|s| &s.key)
            .collect();
        keys.sort();

        for key in &keys {
            self.send(self.protocol.subscribe_command(key));
            if let Some(prime) = self.protocol.prime_command(key) {
                self.send(prime);
            }
        }

        tracing::info!(count = keys.len(), "Replayed subscriptions");
        keys.len()
    }

    /// Drop every callback, unsubscribing every remote key
    pub fn clear(&self) {
        let mut subs = self.subscriptions();
        let mut remote: Vec<FeedbackKey> = subs
            .drain()
            .filter(|(_, s)| s.is_remote())
            .map(|(k, _)| k)
            .collect();
        remote.sort();

        for key in &remote {
            self.send(self.protocol.unsubscribe_command(key));
        }

        tracing::info!(unsubscribed = remote.len(), "Registry cleared");
    }

    /// Keys the endpoint is expected to be pushing
    pub fn remote_keys(&self) -> Vec<FeedbackKey> {
        let mut keys: Vec<FeedbackKey> = self
            .subscriptions()
            .values()
            .filter(|s| s.is_remote())
            .map(|s| s.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Whether any callback is registered under `key`
    pub fn contains(&self, key: &FeedbackKey) -> bool {
        self.subscriptions().contains_key(key)
    }

    /// Number of keys with at least one callback
    pub fn len(&self) -> usize {
        self.subscriptions().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.subscriptions().is_empty()
    }

    /// Statistics for one key
    pub fn stats(&self, key: &FeedbackKey) -> Option<SubscriptionStats> {
        self.subscriptions().get(key).map(|s| SubscriptionStats {
            callbacks: s.callback_count(),
            remote: s.remote_count(),
            delivered: s.delivered,
            age: s.created_at.elapsed(),
        })
    }
}
