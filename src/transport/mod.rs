//! Transport boundary
//!
//! The engine never owns a socket. A host hands it the outbound half as a
//! [`Transport`] and feeds inbound bytes through `Engine::on_data`.
//! [`Connection`] does both for any tokio byte stream.

pub mod connection;

pub use connection::{ChannelTransport, Connection};

use std::io;

/// Outbound half of an endpoint connection
///
/// `send` must not block on the network; implementations queue the text
/// for a writer task.
pub trait Transport: Send + Sync {
    /// Queue already-encoded command text for writing
    fn send(&self, text: &str) -> io::Result<()>;
}
