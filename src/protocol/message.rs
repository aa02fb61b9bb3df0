//! Parsed inbound messages
//!
//! A `Message` is one framed and parsed unit from the endpoint. It lives
//! only for the duration of dispatch.

use serde_json::Value;

use super::key::FeedbackKey;
use super::xml::XmlNode;

/// Reply status carried by a message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageStatus {
    /// No error flagged
    #[default]
    Ok,
    /// Endpoint flagged an error, with its reason text
    Error(String),
}

impl MessageStatus {
    /// Whether the endpoint flagged an error
    pub fn is_error(&self) -> bool {
        matches!(self, MessageStatus::Error(_))
    }
}

/// Message body, addressable by path or by tagged key
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Element subtree from a path-based endpoint
    Xml(XmlNode),
    /// Value from a tagged-JSON endpoint
    Json(Value),
}

impl Payload {
    /// Attribute (XML) or scalar field (JSON) by name
    pub fn attr(&self, name: &str) -> Option<String> {
        match self {
            Payload::Xml(node) => node.attr(name).map(str::to_string),
            Payload::Json(value) => json_field(value, name).and_then(json_scalar),
        }
    }

    /// Text of a named child element (XML) or scalar field (JSON)
    pub fn child_text(&self, name: &str) -> Option<String> {
        match self {
            Payload::Xml(node) => node.child_text(name).map(str::to_string),
            Payload::Json(value) => json_field(value, name).and_then(json_scalar),
        }
    }

    /// Item index of a repeated element (`item` attribute or `id` field)
    pub fn item(&self) -> Option<String> {
        match self {
            Payload::Xml(node) => node.item().map(str::to_string),
            Payload::Json(value) => json_field(value, "id").and_then(json_scalar),
        }
    }

    /// The XML subtree, if this is an XML payload
    pub fn as_xml(&self) -> Option<&XmlNode> {
        match self {
            Payload::Xml(node) => Some(node),
            Payload::Json(_) => None,
        }
    }

    /// The JSON value, if this is a JSON payload
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Xml(_) => None,
        }
    }
}

/// Case-insensitive object field lookup
fn json_field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A framed, parsed inbound unit
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Correlation id echoed from the originating command, if any
    pub correlation_id: Option<String>,
    /// Error flag
    pub status: MessageStatus,
    /// Whether the endpoint marked this as a synchronous reply
    pub sync: bool,
    /// Top-level key for tagged protocols (path-based messages route by tree)
    pub key: Option<FeedbackKey>,
    /// Message body
    pub body: Payload,
}

impl Message {
    /// Create an unsolicited message with no correlation id
    pub fn new(body: Payload) -> Self {
        Self {
            correlation_id: None,
            status: MessageStatus::Ok,
            sync: false,
            key: None,
            body,
        }
    }

    /// Builder: set the correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Builder: set the status
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: set the tagged key
    pub fn with_key(mut self, key: FeedbackKey) -> Self {
        self.key = Some(key);
        self
    }
}
