//! Error types
//!
//! Nothing in here crosses the dispatch boundary: framing and protocol
//! errors are logged and surfaced on the engine's error channel, while
//! `Error` is reserved for the transport-facing API.

use std::fmt;
use std::io;

use crate::protocol::FeedbackKey;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Transport I/O failure
    Io(io::Error),
    /// Inbound data could not be framed or parsed
    Framing(FramingError),
    /// Endpoint reported an error or sent an undecodable reply
    Protocol(ProtocolError),
    /// No transport is attached or the endpoint is offline
    NotConnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Framing(e) => write!(f, "Framing error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::NotConnected => write!(f, "Endpoint not connected"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Framing(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::NotConnected => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

/// Errors raised while turning the byte stream into messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Buffered partial frame exceeded the configured limit and was discarded
    Overflow { limit: usize },
    /// A complete frame could not be parsed
    Malformed(String),
    /// Frame was not valid UTF-8
    Utf8,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::Overflow { limit } => {
                write!(f, "buffer exceeded {} bytes, discarded", limit)
            }
            FramingError::Malformed(reason) => write!(f, "malformed frame: {}", reason),
            FramingError::Utf8 => write!(f, "frame is not valid UTF-8"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Errors reported by the endpoint, or replies we could not decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Reply flagged with an error status
    Status {
        key: Option<FeedbackKey>,
        reason: String,
        correlation_id: Option<String>,
    },
    /// A registered decoder rejected the payload shape for its tag
    Decode {
        tag: String,
        reason: String,
        correlation_id: Option<String>,
    },
}

impl ProtocolError {
    /// Correlation id of the reply that carried the error, if any
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ProtocolError::Status { correlation_id, .. }
            | ProtocolError::Decode { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Status {
                key,
                reason,
                correlation_id,
            } => {
                write!(f, "endpoint error")?;
                if let Some(key) = key {
                    write!(f, " on {}", key)?;
                }
                if let Some(id) = correlation_id {
                    write!(f, " (request {})", id)?;
                }
                write!(f, ": {}", reason)
            }
            ProtocolError::Decode {
                tag,
                reason,
                correlation_id,
            } => {
                write!(f, "cannot decode {}", tag)?;
                if let Some(id) = correlation_id {
                    write!(f, " (request {})", id)?;
                }
                write!(f, ": {}", reason)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
