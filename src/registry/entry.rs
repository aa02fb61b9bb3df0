//! Subscription entry types
//!
//! This module defines the per-key state stored in the registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::{FeedbackKey, MessageStatus, Payload};

/// Identifies one registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(super) u64);

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// What a callback receives for each routed payload
#[derive(Debug, Clone, Copy)]
pub struct Feedback<'a> {
    /// Label of the endpoint that produced the message
    pub source: &'a str,
    /// Key the payload was routed under
    pub key: &'a FeedbackKey,
    /// Correlation id of the message, if it was a reply
    pub correlation_id: Option<&'a str>,
    /// Error flag of the message the payload came from
    pub status: &'a MessageStatus,
    /// Payload addressed to `key`
    pub payload: &'a Payload,
}

/// Feedback callback
pub type Callback = Arc<dyn Fn(&Feedback<'_>) + Send + Sync>;

/// Whether a registration asks the endpoint to push the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Endpoint-side subscription required (feedback)
    Remote,
    /// Local routing only (command replies)
    Local,
}

pub(super) struct CallbackEntry {
    pub id: CallbackId,
    pub interest: Interest,
    pub callback: Callback,
}

/// Callbacks registered under one key
pub struct Subscription {
    /// Key this subscription routes
    pub key: FeedbackKey,

    pub(super) callbacks: Vec<CallbackEntry>,

    /// When the first callback was registered
    pub created_at: Instant,

    /// Number of payloads delivered under this key
    pub delivered: u64,
}

impl Subscription {
    pub(super) fn new(key: FeedbackKey) -> Self {
        Self {
            key,
            callbacks: Vec::new(),
            created_at: Instant::now(),
            delivered: 0,
        }
    }

    /// Total number of callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Number of callbacks that need the endpoint to push this key
    pub fn remote_count(&self) -> usize {
        self.callbacks
            .iter()
            .filter(|c| c.interest == Interest::Remote)
            .count()
    }

    /// Whether the endpoint should currently be pushing this key
    pub fn is_remote(&self) -> bool {
        self.remote_count() > 0
    }

    pub(super) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub(super) fn add(&mut self, id: CallbackId, interest: Interest, callback: Callback) {
        self.callbacks.push(CallbackEntry {
            id,
            interest,
            callback,
        });
    }

    /// Remove a callback, returning its interest if it was present
    pub(super) fn remove(&mut self, id: CallbackId) -> Option<Interest> {
        let idx = self.callbacks.iter().position(|c| c.id == id)?;
        Some(self.callbacks.remove(idx).interest)
    }

    pub(super) fn snapshot(&self) -> Vec<(CallbackId, Callback)> {
        self.callbacks
            .iter()
            .map(|c| (c.id, Arc::clone(&c.callback)))
            .collect()
    }
}

/// Point-in-time view of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub callbacks: usize,
    pub remote: usize,
    pub delivered: u64,
    /// Time since the first callback was registered
    pub age: Duration,
}
