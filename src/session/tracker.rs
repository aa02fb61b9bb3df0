//! Call tracker
//!
//! Registers for the broad call feedback key and keeps one [`CallRecord`]
//! per live call id. The first feedback for an unseen id creates the record
//! and subscribes its narrower per-call key (`status/call[7]`); from then on
//! updates for that call arrive through the narrower key and the broad
//! callback ignores the id. A terminal status removes the record and
//! unsubscribes the narrower key in the same step.
//!
//! Protocol families that cannot address a single call (no
//! [`Protocol::item_key`](crate::protocol::Protocol::item_key)) get no
//! per-call keys; the broad callback then merges every update itself.
//!
//! # Join-to-held policy
//!
//! When a new call appears while another call is on hold, the new call is
//! joined to the first held call found (oldest first). This is unconditional
//! and has only been exercised with two simultaneous calls; behaviour with
//! three or more needs product confirmation. It can be switched off with
//! [`CallTrackerConfig::join_held_calls`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;

use crate::engine::{ConnectionObserver, Engine};
use crate::protocol::{FeedbackKey, Payload};
use crate::registry::CallbackId;

use super::config::CallTrackerConfig;
use super::names::{Clock, NameCache, SystemClock};
use super::state::{CallRecord, CallStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Created(CallRecord),
    Updated(CallRecord),
    /// Final state of the call, `end_time` set
    Removed(CallRecord),
}

#[derive(Debug)]
struct TrackerState {
    calls: HashMap<String, CallRecord>,
    call_callbacks: HashMap<String, CallbackId>,
    names: NameCache,
    next_sequence: u64,
}

/// Keeps a record per live call
pub struct CallTracker {
    me: Weak<CallTracker>,
    engine: Arc<Engine>,
    config: CallTrackerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<CallEvent>,
    call_callback: Mutex<Option<CallbackId>>,
}

impl CallTracker {
    /// Start tracking calls on `engine`
    pub fn new(engine: &Arc<Engine>, config: CallTrackerConfig) -> Arc<Self> {
        let names = NameCache::new(config.name_cache_ttl, config.name_cache_capacity);
        Self::with_parts(engine, config, names, Arc::new(SystemClock))
    }

    /// Start tracking with an explicit name cache and clock
    pub fn with_parts(
        engine: &Arc<Engine>,
        config: CallTrackerConfig,
        names: NameCache,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let tracker = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            engine: Arc::clone(engine),
            config,
            clock,
            state: Mutex::new(TrackerState {
                calls: HashMap::new(),
                call_callbacks: HashMap::new(),
                names,
                next_sequence: 1,
            }),
            events,
            call_callback: Mutex::new(None),
        });

        let weak = tracker.me.clone();
        let id = engine.register(&tracker.config.call_key, move |feedback| {
            if let Some(tracker) = weak.upgrade() {
                tracker.on_call_feedback(feedback.payload);
            }
        });
        *lock(&tracker.call_callback) = Some(id);
        engine.observe(&tracker);

        tracing::debug!(key = %tracker.config.call_key, "Call tracker attached");
        tracker
    }

    /// Receiver for call lifecycle events
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CallTrackerConfig {
        &self.config
    }

    /// Snapshot of a call
    pub fn call(&self, id: &str) -> Option<CallRecord> {
        lock(&self.state).calls.get(id).cloned()
    }

    /// Snapshot of every live call, oldest first
    pub fn calls(&self) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = lock(&self.state).calls.values().cloned().collect();
        calls.sort_by_key(|c| c.sequence);
        calls
    }

    /// Number of connected or held calls
    pub fn active_calls(&self) -> usize {
        lock(&self.state)
            .calls
            .values()
            .filter(|c| c.status.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).calls.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).calls.is_empty()
    }

    /// Per-call feedback key for `id`
    ///
    /// `None` when the protocol family cannot address single calls.
    pub fn call_key_for(&self, id: &str) -> Option<FeedbackKey> {
        self.engine.protocol().item_key(&self.config.call_key, id)
    }

    fn emit(&self, event: CallEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Broad key: creates records for unseen ids
    fn on_call_feedback(&self, payload: &Payload) {
        let Some(id) = payload.item() else {
            tracing::debug!("Call feedback without an id");
            return;
        };

        let known = lock(&self.state).calls.contains_key(&id);
        if known {
            // Otherwise the per-call key delivers it
            if self.call_key_for(&id).is_none() {
                self.on_call_update(&id, payload);
            }
            return;
        }
        let now = self.clock.now();

        let (record, held) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.calls.contains_key(&id) {
                return;
            }
            if CallRecord::is_terminal_feedback(payload) {
                tracing::debug!(call = %id, "Ignoring terminal feedback for unknown call");
                return;
            }

            let mut record = CallRecord::new(id.clone(), now);
            record.sequence = state.next_sequence;
            state.next_sequence += 1;
            record.apply(payload, now);
            sync_name(&mut state.names, &mut record);

            let held = if self.config.join_held_calls {
                state
                    .calls
                    .values()
                    .filter(|c| c.status == CallStatus::OnHold)
                    .min_by_key(|c| c.sequence)
                    .map(|c| c.id.clone())
            } else {
                None
            };

            state.calls.insert(id.clone(), record.clone());
            (record, held)
        };

        tracing::info!(
            call = %id,
            status = %record.status,
            direction = ?record.direction,
            "Call created"
        );

        self.watch_call(&id);
        self.emit(CallEvent::Created(record));

        if let Some(held) = held {
            let command = (self.config.join_command)(&held, &id);
            tracing::info!(call = %id, held = %held, "Joining new call to held call");
            if let Err(e) = self.engine.send_command(&command) {
                tracing::warn!(call = %id, held = %held, error = %e, "Join command not sent");
            }
        }
    }

    fn watch_call(&self, id: &str) {
        let Some(key) = self.call_key_for(id) else {
            return;
        };
        let tracker = self.me.clone();
        let call = id.to_string();
        let callback = self.engine.register(&key, move |feedback| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_call_update(&call, feedback.payload);
            }
        });

        let stale = {
            let mut state = lock(&self.state);
            if state.calls.contains_key(id) {
                state.call_callbacks.insert(id.to_string(), callback);
                false
            } else {
                true
            }
        };
        // Removed while registering (connection loss)
        if stale {
            self.engine.deregister(&key, callback);
        }
    }

    /// Narrow key: merges updates and removes terminal calls
    fn on_call_update(&self, id: &str, payload: &Payload) {
        let now = self.clock.now();

        let event = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let Some(record) = state.calls.get_mut(id) else {
                return;
            };
            let changed = record.apply(payload, now);
            sync_name(&mut state.names, record);

            if record.status.is_terminal() {
                let callback = state.call_callbacks.remove(id);
                state.calls.remove(id).map(|r| (CallEvent::Removed(r), callback))
            } else if changed {
                Some((CallEvent::Updated(record.clone()), None))
            } else {
                None
            }
        };

        match event {
            Some((CallEvent::Removed(record), callback)) => {
                if let (Some(callback), Some(key)) = (callback, self.call_key_for(id)) {
                    self.engine.deregister(&key, callback);
                }
                tracing::info!(
                    call = %id,
                    connected_secs = record.connected_for(now).map(|d| d.as_secs()),
                    "Call removed"
                );
                self.emit(CallEvent::Removed(record));
            }
            Some((event, _)) => self.emit(event),
            None => {}
        }
    }

    /// Remove every call as disconnected
    pub fn force_disconnect(&self) {
        let now = self.clock.now();
        let (mut records, callbacks) = {
            let mut state = lock(&self.state);
            let records: Vec<CallRecord> = state.calls.drain().map(|(_, r)| r).collect();
            let callbacks: Vec<(String, CallbackId)> = state.call_callbacks.drain().collect();
            (records, callbacks)
        };

        for (id, callback) in callbacks {
            if let Some(key) = self.call_key_for(&id) {
                self.engine.deregister(&key, callback);
            }
        }

        if records.is_empty() {
            return;
        }
        tracing::info!(count = records.len(), "Calls force-disconnected");

        records.sort_by_key(|r| r.sequence);
        for mut record in records {
            record.transition(CallStatus::Disconnected, now);
            self.emit(CallEvent::Removed(record));
        }
    }

    /// Deregister every key the tracker holds
    pub fn detach(&self) {
        if let Some(id) = lock(&self.call_callback).take() {
            self.engine.deregister(&self.config.call_key, id);
        }
        let callbacks: Vec<(String, CallbackId)> = lock(&self.state).call_callbacks.drain().collect();
        for (id, callback) in callbacks {
            if let Some(key) = self.call_key_for(&id) {
                self.engine.deregister(&key, callback);
            }
        }
    }
}

impl ConnectionObserver for CallTracker {
    fn on_connection_changed(&self, online: bool) {
        if !online {
            self.force_disconnect();
        }
    }
}

impl Drop for CallTracker {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Fill a missing name from the cache, or remember a known one
fn sync_name(names: &mut NameCache, record: &mut CallRecord) {
    let Some(number) = record.number.as_deref() else {
        return;
    };
    match record.display_name.as_deref() {
        Some(name) => names.insert(number, name),
        None => {
            if let Some(name) = names.get(number) {
                tracing::debug!(call = %record.id, name = %name, "Display name filled from cache");
                record.display_name = Some(name);
            }
        }
    }
}
