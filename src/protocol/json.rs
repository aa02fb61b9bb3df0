//! Tagged JSON feedback family
//!
//! Each frame is a flat object naming its payload through a `topKey` /
//! `type` pair, with a `Sync` flag separating command replies from pushed
//! feedback:
//!
//! ```text
//! {
//!   "CallConnectError": { "error_code": 0, "error_message": "" },
//!   "Status": { "message": "", "state": "OK" },
//!   "Sync": false,
//!   "topKey": "CallConnectError",
//!   "type": "zEvent"
//! }
//! ```
//!
//! The feedback key is `[type, topKey]`. Payload shapes are resolved through
//! an explicit `DecoderTable` rather than by scanning for matching types at
//! runtime; tags without a decoder pass through untouched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, FramingError, ProtocolError};

use super::framer::FrameMode;
use super::key::FeedbackKey;
use super::message::{Message, MessageStatus, Payload};
use super::{Protocol, Route};

/// Status block reported by the endpoint
#[derive(Debug, Clone, Default, Deserialize)]
struct StatusBlock {
    #[serde(default)]
    state: String,
    #[serde(default)]
    message: String,
}

/// Header fields common to every inbound frame
#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(rename = "topKey")]
    top_key: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "Sync", default)]
    sync: bool,
    #[serde(rename = "Status")]
    status: Option<StatusBlock>,
    #[serde(rename = "requestId")]
    request_id: Option<Value>,
}

/// Outbound command object
#[derive(Debug, Serialize)]
struct CommandFrame<'a> {
    command: &'a str,
    #[serde(rename = "requestId")]
    request_id: &'a str,
}

/// Validates and normalises the payload for one tag
pub type DecodeFn = fn(&Value) -> Result<Value, String>;

/// Explicit tag → decoder registration table
#[derive(Clone, Default)]
pub struct DecoderTable {
    decoders: HashMap<String, DecodeFn>,
}

impl std::fmt::Debug for DecoderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&String> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("DecoderTable").field("tags", &tags).finish()
    }
}

impl DecoderTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with decoders for the tags the engine itself relies on
    pub fn with_defaults() -> Self {
        Self::new()
            .with("FeedbackList", expect_path_list)
            .with("CallStatus", expect_object)
            .with("CallConnectError", expect_object)
            .with("PhonebookListResult", expect_object)
    }

    /// Builder: register a decoder for a tag
    pub fn with(mut self, tag: &str, decoder: DecodeFn) -> Self {
        self.register(tag, decoder);
        self
    }

    /// Register a decoder for a tag, replacing any previous one
    pub fn register(&mut self, tag: &str, decoder: DecodeFn) {
        self.decoders.insert(tag.to_lowercase(), decoder);
    }

    /// Whether a decoder is registered for a tag
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(&tag.to_lowercase())
    }

    /// Decode `value` for `tag`; `None` if the tag is unknown
    pub fn decode(&self, tag: &str, value: &Value) -> Option<Result<Value, String>> {
        self.decoders
            .get(&tag.to_lowercase())
            .map(|decoder| decoder(value))
    }
}

fn expect_object(value: &Value) -> Result<Value, String> {
    if value.is_object() {
        Ok(value.clone())
    } else {
        Err(format!("expected object, found {}", kind_name(value)))
    }
}

fn expect_path_list(value: &Value) -> Result<Value, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("expected array, found {}", kind_name(value)))?;
    if items.iter().all(Value::is_string) {
        Ok(value.clone())
    } else {
        Err("expected array of path strings".to_string())
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Tagged JSON protocol adapter
#[derive(Debug, Clone)]
pub struct JsonProtocol {
    decoders: DecoderTable,
}

impl JsonProtocol {
    /// Adapter with the default decoder table
    pub fn new() -> Self {
        Self::with_decoders(DecoderTable::with_defaults())
    }

    /// Adapter with a custom decoder table
    pub fn with_decoders(decoders: DecoderTable) -> Self {
        Self { decoders }
    }

    /// The decoder table
    pub fn decoders(&self) -> &DecoderTable {
        &self.decoders
    }
}

impl Default for JsonProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for JsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn frame_mode(&self) -> FrameMode {
        FrameMode::Json
    }

    fn parse(&self, frame: &[u8]) -> Result<Message, Error> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| FramingError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(FramingError::Malformed("frame is not an object".into()).into());
        }

        let envelope: Envelope = serde_json::from_value(value.clone())
            .map_err(|e| FramingError::Malformed(e.to_string()))?;

        let key = match (&envelope.kind, &envelope.top_key) {
            (Some(kind), Some(top)) => Some(FeedbackKey::new([kind.as_str(), top.as_str()])),
            _ => None,
        };

        let mut body = envelope
            .top_key
            .as_deref()
            .and_then(|top| value.get(top))
            .cloned()
            .unwrap_or_else(|| value.clone());

        // Read before decoding so a rejected reply still resolves its command
        let correlation_id = envelope.request_id.and_then(|id| match id {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        if let Some(top) = envelope.top_key.as_deref() {
            match self.decoders.decode(top, &body) {
                Some(Ok(decoded)) => body = decoded,
                Some(Err(reason)) => {
                    return Err(ProtocolError::Decode {
                        tag: top.to_string(),
                        reason,
                        correlation_id,
                    }
                    .into())
                }
                None => {
                    tracing::trace!(tag = top, "No decoder registered, passing raw payload");
                }
            }
        }

        let status = match envelope.status {
            Some(s) if s.state.eq_ignore_ascii_case("error") => MessageStatus::Error(s.message),
            _ => MessageStatus::Ok,
        };

        Ok(Message {
            correlation_id,
            status,
            sync: envelope.sync,
            key,
            body: Payload::Json(body),
        })
    }

    fn route(&self, message: &Message, wants: &dyn Fn(&FeedbackKey) -> bool) -> Vec<Route> {
        match &message.key {
            Some(key) if wants(key) => vec![Route {
                key: key.clone(),
                payload: message.body.clone(),
            }],
            _ => Vec::new(),
        }
    }

    fn item_key(&self, _key: &FeedbackKey, _item: &str) -> Option<FeedbackKey> {
        None
    }

    fn encode_command(&self, command: &str, correlation_id: &str) -> String {
        let frame = CommandFrame {
            command: command.trim_end(),
            request_id: correlation_id,
        };
        match serde_json::to_string(&frame) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode command");
                String::new()
            }
        }
    }

    fn subscribe_command(&self, key: &FeedbackKey) -> String {
        format!("zFeedback Register Path: {}", key.to_path())
    }

    fn unsubscribe_command(&self, key: &FeedbackKey) -> String {
        format!("zFeedback Deregister Path: {}", key.to_path())
    }

    fn prime_command(&self, key: &FeedbackKey) -> Option<String> {
        match key.segments() {
            [kind, top] if kind == "zstatus" => Some(format!("zStatus {}", top)),
            _ => None,
        }
    }

    fn subscription_list_command(&self) -> String {
        "zFeedback List".to_string()
    }

    fn parse_subscription_list(&self, message: &Message) -> Vec<FeedbackKey> {
        message
            .body
            .as_json()
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_str)
                    .map(FeedbackKey::parse)
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_parse_event() {
        let protocol = JsonProtocol::new();
        let message = protocol
            .parse(&frame(json!({
                "CallConnectError": {"error_code": 0, "error_message": ""},
                "Status": {"message": "", "state": "OK"},
                "Sync": false,
                "topKey": "CallConnectError",
                "type": "zEvent"
            })))
            .unwrap();

        assert_eq!(message.key, Some(FeedbackKey::new(["zevent", "callconnecterror"])));
        assert!(!message.sync);
        assert_eq!(message.status, MessageStatus::Ok);
        assert_eq!(message.body.child_text("error_code").as_deref(), Some("0"));
    }

    #[test]
    fn test_parse_error_reply_with_request_id() {
        let protocol = JsonProtocol::new();
        let message = protocol
            .parse(&frame(json!({
                "Status": {"message": "Invalid command", "state": "Error"},
                "Sync": true,
                "requestId": 17,
                "topKey": "Call",
                "type": "zCommand"
            })))
            .unwrap();

        assert!(message.sync);
        assert_eq!(message.correlation_id.as_deref(), Some("17"));
        assert_eq!(message.status, MessageStatus::Error("Invalid command".into()));
    }

    #[test]
    fn test_decoder_rejects_bad_shape() {
        let protocol = JsonProtocol::new();
        let err = protocol
            .parse(&frame(json!({
                "CallStatus": "not an object",
                "topKey": "CallStatus",
                "type": "zStatus"
            })))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Decode { ref tag, correlation_id: None, .. }) if tag == "CallStatus"
        ));
    }

    #[test]
    fn test_decode_error_keeps_request_id() {
        let protocol = JsonProtocol::new();
        let err = protocol
            .parse(&frame(json!({
                "CallStatus": "bad",
                "Sync": true,
                "requestId": "12",
                "topKey": "CallStatus",
                "type": "zStatus"
            })))
            .unwrap_err();

        match err {
            Error::Protocol(e) => assert_eq!(e.correlation_id(), Some("12")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_passes_raw() {
        let protocol = JsonProtocol::new();
        assert!(!protocol.decoders().contains("SharingState"));

        let message = protocol
            .parse(&frame(json!({
                "SharingState": [1, 2],
                "topKey": "SharingState",
                "type": "zStatus"
            })))
            .unwrap();
        assert_eq!(message.body, Payload::Json(json!([1, 2])));
    }

    #[test]
    fn test_custom_decoder() {
        fn upper(value: &Value) -> Result<Value, String> {
            Ok(Value::String(value.as_str().unwrap_or_default().to_uppercase()))
        }
        let protocol = JsonProtocol::with_decoders(DecoderTable::new().with("Name", upper));
        let message = protocol
            .parse(&frame(json!({"Name": "room", "topKey": "Name", "type": "zStatus"})))
            .unwrap();
        assert_eq!(message.body, Payload::Json(json!("ROOM")));
    }

    #[test]
    fn test_route_exact_key_only() {
        let protocol = JsonProtocol::new();
        let message = protocol
            .parse(&frame(json!({"CallStatus": {"state": "IN_MEETING"}, "topKey": "CallStatus", "type": "zStatus"})))
            .unwrap();

        let key = FeedbackKey::parse("zStatus/CallStatus");
        let routes = protocol.route(&message, &|k| *k == key);
        assert_eq!(routes.len(), 1);
        assert!(protocol
            .route(&message, &|k| *k == FeedbackKey::parse("zstatus"))
            .is_empty());
        // Items are never split out of a tagged payload
        assert_eq!(protocol.item_key(&key, "7"), None);
    }

    #[test]
    fn test_commands_and_subscription_list() {
        let protocol = JsonProtocol::new();
        let key = FeedbackKey::parse("zStatus/CallStatus");

        assert_eq!(
            protocol.encode_command("zCommand Call Leave", "4"),
            "{\"command\":\"zCommand Call Leave\",\"requestId\":\"4\"}\n"
        );
        assert_eq!(protocol.prime_command(&key).as_deref(), Some("zStatus callstatus"));
        assert_eq!(protocol.prime_command(&FeedbackKey::parse("zEvent/X")), None);

        let reply = protocol
            .parse(&frame(json!({
                "FeedbackList": ["/zStatus/CallStatus", "/zEvent/PhonebookBasicInfoChange"],
                "Sync": true,
                "topKey": "FeedbackList",
                "type": "zFeedback"
            })))
            .unwrap();
        assert_eq!(
            protocol.parse_subscription_list(&reply),
            vec![key, FeedbackKey::parse("zevent/phonebookbasicinfochange")]
        );
    }

    #[test]
    fn test_malformed_json() {
        let protocol = JsonProtocol::new();
        assert!(matches!(
            protocol.parse(b"{not json}"),
            Err(Error::Framing(FramingError::Malformed(_)))
        ));
        assert!(protocol.parse(b"[1,2]").is_err());
    }
}
