//! Call state machine
//!
//! ```text
//!  (absent) ──► Connecting/Ringing ──► Connected ◄──► OnHold
//!                       │                  │
//!                       └──────────────────┴──► Disconnected ──► (removed)
//! ```
//!
//! Status, direction, answer state and the other attributes arrive as
//! independent feedback and are merged into the same record.

use std::time::{Duration, Instant};

use crate::protocol::Payload;

/// Call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    /// Outgoing call being set up
    Connecting,
    /// Incoming call alerting
    Ringing,
    Connected,
    OnHold,
    /// Teardown in progress
    Disconnecting,
    /// Terminal; the record is removed
    Disconnected,
}

impl CallStatus {
    /// Parse a status value from either endpoint family
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "dialling" | "dialing" | "connecting" | "earlymedia" | "connectingmeeting" => {
                Some(Self::Connecting)
            }
            "ringing" | "alerting" => Some(Self::Ringing),
            "connected" | "inmeeting" => Some(Self::Connected),
            "onhold" | "hold" | "preserved" | "remotepreserved" => Some(Self::OnHold),
            "disconnecting" | "leavingmeeting" => Some(Self::Disconnecting),
            "disconnected" | "idle" | "notinmeeting" => Some(Self::Disconnected),
            _ => None,
        }
    }

    /// Whether the record ends here
    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }

    /// Whether media is flowing (or held)
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::OnHold)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "Connecting",
            Self::Ringing => "Ringing",
            Self::Connected => "Connected",
            Self::OnHold => "OnHold",
            Self::Disconnecting => "Disconnecting",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// Call direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallDirection {
    #[default]
    Unknown,
    Incoming,
    Outgoing,
}

impl CallDirection {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "incoming" => Self::Incoming,
            "outgoing" => Self::Outgoing,
            _ => Self::Unknown,
        }
    }
}

/// One call known to the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Endpoint-assigned call id
    pub id: String,

    pub status: CallStatus,

    pub direction: CallDirection,

    /// Remote party name, possibly filled from the name cache
    pub display_name: Option<String>,

    /// Remote number or URI
    pub number: Option<String>,

    /// Answered, Unanswered, Autoanswered, Ignored
    pub answer_state: Option<String>,

    /// Call protocol reported by the endpoint (SIP, H323, ...)
    pub protocol: Option<String>,

    /// Duration as reported by the endpoint
    pub duration: Option<Duration>,

    /// When the record was created
    pub dial_time: Instant,

    /// First transition into `Connected`
    pub start_time: Option<Instant>,

    /// When the record was removed
    pub end_time: Option<Instant>,

    /// Creation order within the tracker
    pub(super) sequence: u64,
}

impl CallRecord {
    /// Create a record in its initial state
    pub fn new(id: impl Into<String>, now: Instant) -> Self {
        Self {
            id: id.into(),
            status: CallStatus::Connecting,
            direction: CallDirection::Unknown,
            display_name: None,
            number: None,
            answer_state: None,
            protocol: None,
            duration: None,
            dial_time: now,
            start_time: None,
            end_time: None,
            sequence: 0,
        }
    }

    /// Whether a feedback payload ends this call
    ///
    /// Ghost elements mark calls that no longer exist on the endpoint.
    pub fn is_terminal_feedback(payload: &Payload) -> bool {
        let ghost = payload
            .attr("ghost")
            .map(|g| g.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        ghost
            || status_text(payload)
                .and_then(|s| CallStatus::parse(&s))
                .map(CallStatus::is_terminal)
                .unwrap_or(false)
    }

    /// Merge attribute feedback into the record
    ///
    /// Returns true if anything changed.
    pub fn apply(&mut self, payload: &Payload, now: Instant) -> bool {
        let before = self.clone();

        if Self::is_terminal_feedback(payload) {
            self.transition(CallStatus::Disconnected, now);
        } else if let Some(value) = status_text(payload) {
            match CallStatus::parse(&value) {
                Some(status) => self.transition(status, now),
                None => tracing::debug!(call = %self.id, status = %value, "Unknown call status"),
            }
        }

        if let Some(value) = payload.child_text("Direction") {
            self.direction = CallDirection::parse(&value);
        }
        if let Some(value) = non_empty(payload.child_text("DisplayName")) {
            self.display_name = Some(value);
        }
        if let Some(value) =
            non_empty(payload.child_text("RemoteNumber")).or_else(|| non_empty(payload.child_text("CallbackNumber")))
        {
            self.number = Some(value);
        }
        if let Some(value) = non_empty(payload.child_text("AnswerState")) {
            self.answer_state = Some(value);
        }
        if let Some(value) = non_empty(payload.child_text("Protocol")) {
            self.protocol = Some(value);
        }
        if let Some(secs) = payload
            .child_text("Duration")
            .and_then(|d| d.trim().parse::<u64>().ok())
        {
            self.duration = Some(Duration::from_secs(secs));
        }

        *self != before
    }

    /// Move to `status`, stamping start and end times
    pub fn transition(&mut self, status: CallStatus, now: Instant) {
        if self.status == status {
            return;
        }
        tracing::debug!(call = %self.id, from = %self.status, to = %status, "Call transition");

        if status == CallStatus::Connected && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if status.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = status;
    }

    /// Time connected so far, or total once ended
    pub fn connected_for(&self, now: Instant) -> Option<Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or(now).saturating_duration_since(start))
    }
}

/// `Status` element (XML) or `state` field (JSON)
fn status_text(payload: &Payload) -> Option<String> {
    payload
        .child_text("Status")
        .or_else(|| payload.child_text("State"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
