//! Path-based XML feedback family
//!
//! Commands are text lines; replies and feedback are `<XmlDoc>` documents.
//! The path of element names below the document root forms the feedback
//! key, and an element carrying an `item` attribute is also addressable by
//! the qualified segment `name[item]`:
//!
//! ```text
//! <XmlDoc>
//!   <Status>                     status
//!     <Call item="7">            status/call   and   status/call[7]
//!       <Status>Ringing</Status> status/call/status
//! ```
//!
//! Command replies echo the correlation id in the root `resultId`
//! attribute.

use crate::error::{Error, FramingError};

use super::framer::FrameMode;
use super::key::FeedbackKey;
use super::message::{Message, MessageStatus, Payload};
use super::xml::{self, XmlNode};
use super::{Protocol, Route};

/// Root attribute carrying the echoed correlation id
const RESULT_ID_ATTR: &str = "resultId";

/// Path-based XML protocol adapter
#[derive(Debug, Clone, Default)]
pub struct XapiProtocol;

impl XapiProtocol {
    pub fn new() -> Self {
        Self
    }

    fn status_of(root: &XmlNode) -> MessageStatus {
        for child in &root.children {
            let flagged = child
                .attr("status")
                .is_some_and(|s| s.eq_ignore_ascii_case("error"))
                || child.name.ends_with("Error");
            if flagged {
                let reason = child
                    .child_text("Reason")
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .or_else(|| (!child.text.is_empty()).then(|| child.text.clone()))
                    .unwrap_or_else(|| child.name.clone());
                return MessageStatus::Error(reason);
            }
            // Command responses nest the result one level down
            if child.name.eq_ignore_ascii_case("CommandResponse") {
                let nested = Self::status_of(child);
                if nested.is_error() {
                    return nested;
                }
            }
        }
        MessageStatus::Ok
    }

    fn walk(
        node: &XmlNode,
        path: &FeedbackKey,
        wants: &dyn Fn(&FeedbackKey) -> bool,
        routes: &mut Vec<Route>,
    ) {
        let plain = path.child(&node.name);
        if wants(&plain) {
            routes.push(Route {
                key: plain.clone(),
                payload: Payload::Xml(node.clone()),
            });
        }
        if let Some(item) = node.item() {
            let qualified = path.item_child(&node.name, item);
            if wants(&qualified) {
                routes.push(Route {
                    key: qualified,
                    payload: Payload::Xml(node.clone()),
                });
            }
        }
        for child in &node.children {
            Self::walk(child, &plain, wants, routes);
        }
    }

    fn find<'a>(node: &'a XmlNode, name: &str) -> Option<&'a XmlNode> {
        if node.name.eq_ignore_ascii_case(name) {
            return Some(node);
        }
        node.children.iter().find_map(|c| Self::find(c, name))
    }
}

/// `call[7]` becomes `call 7` in query syntax
fn query_segment(segment: &str) -> String {
    match segment.split_once('[') {
        Some((name, rest)) => format!("{} {}", name, rest.trim_end_matches(']')),
        None => segment.to_string(),
    }
}

impl Protocol for XapiProtocol {
    fn name(&self) -> &'static str {
        "xapi"
    }

    fn frame_mode(&self) -> FrameMode {
        FrameMode::Xml
    }

    fn parse(&self, frame: &[u8]) -> Result<Message, Error> {
        let text = std::str::from_utf8(frame).map_err(|_| FramingError::Utf8)?;
        let root = xml::parse(text)?;

        Ok(Message {
            correlation_id: root
                .attr(RESULT_ID_ATTR)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            status: Self::status_of(&root),
            sync: root.attr(RESULT_ID_ATTR).is_some(),
            key: None,
            body: Payload::Xml(root),
        })
    }

    fn route(&self, message: &Message, wants: &dyn Fn(&FeedbackKey) -> bool) -> Vec<Route> {
        let mut routes = Vec::new();
        if let Payload::Xml(root) = &message.body {
            let base = FeedbackKey::default();
            for child in &root.children {
                Self::walk(child, &base, wants, &mut routes);
            }
        }
        routes
    }

    fn item_key(&self, key: &FeedbackKey, item: &str) -> Option<FeedbackKey> {
        let (last, parent) = key.segments().split_last()?;
        Some(FeedbackKey::new(parent).item_child(last, item))
    }

    fn encode_command(&self, command: &str, correlation_id: &str) -> String {
        format!(
            "{} | {}=\"{}\"\r\n",
            command.trim_end(),
            RESULT_ID_ATTR,
            correlation_id
        )
    }

    fn subscribe_command(&self, key: &FeedbackKey) -> String {
        format!("xFeedback register {}", key.to_path())
    }

    fn unsubscribe_command(&self, key: &FeedbackKey) -> String {
        format!("xFeedback deregister {}", key.to_path())
    }

    fn prime_command(&self, key: &FeedbackKey) -> Option<String> {
        let (first, rest) = key.segments().split_first()?;
        if first != "status" || rest.is_empty() {
            return None;
        }
        let query: Vec<String> = rest.iter().map(|s| query_segment(s)).collect();
        Some(format!("xStatus {}", query.join(" ")))
    }

    fn subscription_list_command(&self) -> String {
        "xFeedback list".to_string()
    }

    fn parse_subscription_list(&self, message: &Message) -> Vec<FeedbackKey> {
        let Payload::Xml(root) = &message.body else {
            return Vec::new();
        };
        Self::find(root, "FeedbackList")
            .map(|list| {
                list.children
                    .iter()
                    .map(|e| FeedbackKey::parse(&e.text))
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}
