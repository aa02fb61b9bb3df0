//! Feedback registry for keyed callback routing
//!
//! The registry maps feedback keys to the callbacks interested in them and
//! keeps the endpoint's push subscriptions in step with that interest.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<FeedbackRegistry>
//!                   ┌─────────────────────────────┐
//!                   │ subscriptions: HashMap<Key, │
//!                   │   Subscription {            │
//!                   │     callbacks: [cb, cb..],  │
//!                   │   }                         │
//!                   │ >                           │
//!                   └──────────────┬──────────────┘
//!                                  │
//!        ┌─────────────────────────┼─────────────────────────┐
//!        │                         │                         │
//!        ▼                         ▼                         ▼
//!   register(k)              dispatch(msg)             deregister(k)
//!   first remote cb          route → snapshot          last remote cb
//!   ──► subscribe cmd        ──► callbacks             ──► unsubscribe cmd
//! ```
//!
//! # Reference counting
//!
//! A key is subscribed on the endpoint exactly while at least one remote
//! callback is registered for it. Local callbacks (command replies) are
//! counted separately and never touch the endpoint's subscription state.

pub mod entry;
pub mod store;

pub use entry::{Callback, CallbackId, Feedback, Interest, Subscription, SubscriptionStats};
pub use store::FeedbackRegistry;

use crate::error::Result;
use crate::protocol::PendingCommand;

/// Outbound command path used by the registry and the consumers
///
/// Implementations tag the command with a correlation id and write it to
/// the transport without blocking on a reply.
pub trait CommandSink: Send + Sync {
    /// Send a command, returning the pending entry for its reply
    fn send_command(&self, command: &str) -> Result<PendingCommand>;
}
