//! Endpoint protocol families
//!
//! Every endpoint family is described by one `Protocol` implementation. The
//! engine, the registry and the resync monitor only ever talk to this trait,
//! so they stay agnostic of whether feedback arrives as XML trees or as
//! tagged JSON objects.
//!
//! ```text
//!  bytes ──► Framer ──► Protocol::parse ──► Message
//!                                              │
//!                      Protocol::route(message, wants)
//!                                              │
//!                                              ▼
//!                               [(FeedbackKey, Payload), ...]
//! ```

pub mod correlator;
pub mod framer;
pub mod json;
pub mod key;
pub mod message;
pub mod xapi;
pub mod xml;

pub use correlator::{Correlator, PendingCommand};
pub use framer::{FrameMode, Framer};
pub use json::{DecoderTable, JsonProtocol};
pub use key::FeedbackKey;
pub use message::{Message, MessageStatus, Payload};
pub use xapi::XapiProtocol;
pub use xml::XmlNode;

use crate::error::Error;

/// A payload addressed to one feedback key
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub key: FeedbackKey,
    pub payload: Payload,
}

/// Adapter for one endpoint family
pub trait Protocol: Send + Sync + 'static {
    /// Short family name for logs
    fn name(&self) -> &'static str;

    /// How inbound bytes are split into frames
    fn frame_mode(&self) -> FrameMode;

    /// Parse one complete frame
    fn parse(&self, frame: &[u8]) -> Result<Message, Error>;

    /// Split a message into payloads for every key `wants` accepts, in
    /// document order
    fn route(&self, message: &Message, wants: &dyn Fn(&FeedbackKey) -> bool) -> Vec<Route>;

    /// Narrower key addressing one item of the repeated element behind `key`
    ///
    /// `None` when the family only routes whole collections; consumers then
    /// receive every item's updates through `key` itself.
    fn item_key(&self, key: &FeedbackKey, item: &str) -> Option<FeedbackKey>;

    /// Wire text for a command tagged with a correlation id, terminator included
    fn encode_command(&self, command: &str, correlation_id: &str) -> String;

    /// Command asking the endpoint to start pushing `key`
    fn subscribe_command(&self, key: &FeedbackKey) -> String;

    /// Command asking the endpoint to stop pushing `key`
    fn unsubscribe_command(&self, key: &FeedbackKey) -> String;

    /// One-shot query for the current value of `key`, for status-class keys
    fn prime_command(&self, key: &FeedbackKey) -> Option<String>;

    /// Command requesting the endpoint's list of active subscriptions
    fn subscription_list_command(&self) -> String;

    /// Extract the active subscriptions from a reply to
    /// `subscription_list_command`
    fn parse_subscription_list(&self, message: &Message) -> Vec<FeedbackKey>;
}
