//! Feedback engine for video-conferencing codecs
//!
//! Drives endpoints that push XML path feedback or tagged JSON feedback over
//! a persistent byte stream. The host owns the socket or serial line; this
//! crate frames what arrives, correlates replies with the commands that
//! asked for them, routes feedback to registered callbacks and keeps the
//! endpoint's subscriptions in step with that interest.
//!
//! ```text
//!            Transport (host-owned)
//!                   │ bytes
//!                   ▼
//!   ┌──────────────────────────────────────┐
//!   │ Engine                               │
//!   │  Framer ─► Protocol ─► Correlator    │
//!   │                  │                   │
//!   │                  ▼                   │
//!   │          FeedbackRegistry ◄── Resync │
//!   └──────────────────┬───────────────────┘
//!                      │ callbacks
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//!     CallTracker            DirectoryTree
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vcodec_rs::{CallTracker, CallTrackerConfig, Connection, Engine, EngineConfig, XapiProtocol};
//!
//! # async fn run() -> vcodec_rs::Result<()> {
//! let engine = Engine::new(EngineConfig::with_name("room-1"), XapiProtocol::new());
//! let calls = CallTracker::new(&engine, CallTrackerConfig::default());
//! let _resync = engine.spawn_resync_task();
//!
//! let addr = "10.0.0.20:4000".parse().unwrap();
//! Connection::connect(Arc::clone(&engine), addr).await?.run().await?;
//! # drop(calls);
//! # Ok(())
//! # }
//! ```

pub mod directory;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testing;

pub use directory::{DirectoryConfig, DirectoryEvent, DirectoryTree, FolderRef, Partition};
pub use engine::{ConnectionObserver, Engine, EngineConfig};
pub use error::{Error, FramingError, ProtocolError, Result};
pub use protocol::{FeedbackKey, JsonProtocol, Message, Payload, PendingCommand, Protocol, XapiProtocol};
pub use registry::{CallbackId, Feedback, FeedbackRegistry};
pub use session::{CallEvent, CallRecord, CallStatus, CallTracker, CallTrackerConfig};
pub use stats::EngineStatsSnapshot;
pub use transport::{Connection, Transport};
