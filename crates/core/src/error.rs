// Error values carried inside lifecycle contexts and events
//
// ErrorValue is data, not a Rust error: it is recorded in agent/session contexts
// and serialized into the event log.

use serde::{Deserialize, Serialize};

/// A recorded error, stable enough to persist and replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Machine-readable error code (e.g. "AGENT_TURN_LIMIT_EXCEEDED")
    pub code: String,
    /// Human-readable description
    pub message: String,
}

impl ErrorValue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Error returned when an event payload does not match its channel schema.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Payload could not be decoded into the channel's shape
    #[error("invalid {channel} payload: {source}")]
    Invalid {
        channel: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The channel has no payload schema known to this build
    #[error("unknown channel")]
    UnknownChannel,
}
