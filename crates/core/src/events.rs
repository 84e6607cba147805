// Event Protocol
//
// This module defines the event schema shared by the event log, the subscriber
// broker and the projection engine. Every event belongs to exactly one stream
// and carries a stream-local offset assigned by the log at append time.
//
// Payloads are stored as structured JSON. Consumers decode them into the closed
// `EventPayload` enum, one concrete shape per channel.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::PayloadError;
use crate::lifecycle::{AgentLifecycleContext, SessionLifecycleContext};

/// Stream-local, monotonically increasing sequence number (starts at 0)
pub type Offset = u64;

// ============================================================================
// Stream Identifier
// ============================================================================

/// Identifier of an event stream (a session id or an ephemeral job id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for StreamId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Event channel. Determines the payload shape.
///
/// Channel names this build does not know decode to `Unknown`, so a newer
/// producer never breaks an older consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Streamed message text for an agent turn
    Chunk,
    /// Tool call started / finished
    ToolCall,
    /// User presence heartbeat
    Presence,
    /// Sandbox terminal output line
    Terminal,
    /// Workflow step progress
    Workflow,
    /// Agent lifecycle snapshot
    AgentState,
    /// Session lifecycle snapshot
    Status,
    /// Any channel not known to this build
    Unknown,
}

impl Channel {
    /// All channels with a known payload schema
    pub const KNOWN: [Channel; 7] = [
        Channel::Chunk,
        Channel::ToolCall,
        Channel::Presence,
        Channel::Terminal,
        Channel::Workflow,
        Channel::AgentState,
        Channel::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chunk => "chunk",
            Channel::ToolCall => "tool_call",
            Channel::Presence => "presence",
            Channel::Terminal => "terminal",
            Channel::Workflow => "workflow",
            Channel::AgentState => "agent_state",
            Channel::Status => "status",
            Channel::Unknown => "unknown",
        }
    }

    /// Parse a channel name. Never fails: unrecognized names become `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "chunk" => Channel::Chunk,
            "tool_call" => Channel::ToolCall,
            "presence" => Channel::Presence,
            "terminal" => Channel::Terminal,
            "workflow" => Channel::Workflow,
            "agent_state" => Channel::AgentState,
            "status" => Channel::Status,
            _ => Channel::Unknown,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Channel::parse(&name))
    }
}

// ============================================================================
// Standard Event Schema
// ============================================================================

/// An event as stored in the log.
///
/// - `id`: UUID v7 string, unique across streams
/// - `stream_id`: stream this event belongs to
/// - `channel`: selects the payload schema
/// - `payload`: channel-specific structured data
/// - `timestamp`: wall clock milliseconds at append time
/// - `offset`: stream-local position, assigned by the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub stream_id: StreamId,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    pub offset: Offset,
}

impl Event {
    /// Create an event at the given offset. Only event logs should call this.
    pub fn new(
        stream_id: StreamId,
        channel: Channel,
        payload: serde_json::Value,
        offset: Offset,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            stream_id,
            channel,
            payload,
            timestamp: Utc::now().timestamp_millis(),
            offset,
        }
    }

    /// Decode the payload against the channel schema
    pub fn decode(&self) -> Result<EventPayload, PayloadError> {
        EventPayload::decode(self.channel, &self.payload)
    }
}

// ============================================================================
// Typed Payloads
// ============================================================================

/// Data for the chunk channel: a fragment of an agent's message for one turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub agent_id: String,
    pub turn: u32,
    pub text: String,
}

impl ChunkData {
    pub fn new(agent_id: impl Into<String>, turn: u32, text: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            turn,
            text: text.into(),
        }
    }
}

/// Tool call execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Complete,
    Error,
}

/// Data for the tool_call channel.
///
/// `call_id` is carried end-to-end by the producer; the projection pairs
/// start and completion strictly on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallData {
    pub fn started(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: ToolCallStatus::Running,
            input: Some(input),
            output: None,
            error: None,
        }
    }

    pub fn completed(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: ToolCallStatus::Complete,
            input: None,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: ToolCallStatus::Error,
            input: None,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Data for the presence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub user_id: String,
    /// Milliseconds since epoch, set by the client
    pub last_seen: i64,
    /// Opaque editor/terminal cursor position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<serde_json::Value>,
}

/// Which output stream a terminal line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStream {
    #[default]
    Stdout,
    Stderr,
}

/// Data for the terminal channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalData {
    pub terminal_id: String,
    #[serde(default)]
    pub stream: TerminalStream,
    pub line: String,
}

/// Workflow step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Data for the workflow channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowData {
    pub workflow_id: String,
    pub step: String,
    pub status: WorkflowStepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Data for the agent_state channel: the machine output after a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateData {
    pub agent_id: String,
    pub context: AgentLifecycleContext,
}

/// Data for the status channel: the session machine output after a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusData {
    pub session_id: String,
    pub context: SessionLifecycleContext,
}

/// Typed payload, one variant per known channel
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Chunk(ChunkData),
    ToolCall(ToolCallData),
    Presence(PresenceData),
    Terminal(TerminalData),
    Workflow(WorkflowData),
    AgentState(AgentStateData),
    Status(SessionStatusData),
}

impl EventPayload {
    /// Channel this payload is published on
    pub fn channel(&self) -> Channel {
        match self {
            EventPayload::Chunk(_) => Channel::Chunk,
            EventPayload::ToolCall(_) => Channel::ToolCall,
            EventPayload::Presence(_) => Channel::Presence,
            EventPayload::Terminal(_) => Channel::Terminal,
            EventPayload::Workflow(_) => Channel::Workflow,
            EventPayload::AgentState(_) => Channel::AgentState,
            EventPayload::Status(_) => Channel::Status,
        }
    }

    /// Decode a stored JSON payload for the given channel
    pub fn decode(channel: Channel, value: &serde_json::Value) -> Result<Self, PayloadError> {
        fn parse<T: serde::de::DeserializeOwned>(
            channel: Channel,
            value: &serde_json::Value,
        ) -> Result<T, PayloadError> {
            T::deserialize(value).map_err(|source| PayloadError::Invalid {
                channel: channel.as_str(),
                source,
            })
        }

        Ok(match channel {
            Channel::Chunk => EventPayload::Chunk(parse(channel, value)?),
            Channel::ToolCall => EventPayload::ToolCall(parse(channel, value)?),
            Channel::Presence => EventPayload::Presence(parse(channel, value)?),
            Channel::Terminal => EventPayload::Terminal(parse(channel, value)?),
            Channel::Workflow => EventPayload::Workflow(parse(channel, value)?),
            Channel::AgentState => EventPayload::AgentState(parse(channel, value)?),
            Channel::Status => EventPayload::Status(parse(channel, value)?),
            Channel::Unknown => return Err(PayloadError::UnknownChannel),
        })
    }

    /// Split into the (channel, JSON) pair accepted by `EventLog::append`
    pub fn into_parts(self) -> Result<(Channel, serde_json::Value), serde_json::Error> {
        let channel = self.channel();
        let value = match self {
            EventPayload::Chunk(data) => serde_json::to_value(data)?,
            EventPayload::ToolCall(data) => serde_json::to_value(data)?,
            EventPayload::Presence(data) => serde_json::to_value(data)?,
            EventPayload::Terminal(data) => serde_json::to_value(data)?,
            EventPayload::Workflow(data) => serde_json::to_value(data)?,
            EventPayload::AgentState(data) => serde_json::to_value(data)?,
            EventPayload::Status(data) => serde_json::to_value(data)?,
        };
        Ok((channel, value))
    }
}

// ============================================================================
// From implementations
// ============================================================================

impl From<ChunkData> for EventPayload {
    fn from(data: ChunkData) -> Self {
        EventPayload::Chunk(data)
    }
}

impl From<ToolCallData> for EventPayload {
    fn from(data: ToolCallData) -> Self {
        EventPayload::ToolCall(data)
    }
}

impl From<PresenceData> for EventPayload {
    fn from(data: PresenceData) -> Self {
        EventPayload::Presence(data)
    }
}

impl From<TerminalData> for EventPayload {
    fn from(data: TerminalData) -> Self {
        EventPayload::Terminal(data)
    }
}

impl From<WorkflowData> for EventPayload {
    fn from(data: WorkflowData) -> Self {
        EventPayload::Workflow(data)
    }
}

impl From<AgentStateData> for EventPayload {
    fn from(data: AgentStateData) -> Self {
        EventPayload::AgentState(data)
    }
}

impl From<SessionStatusData> for EventPayload {
    fn from(data: SessionStatusData) -> Self {
        EventPayload::Status(data)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_serialization() {
        assert_eq!(serde_json::to_value(Channel::ToolCall).unwrap(), "tool_call");
        assert_eq!(
            serde_json::from_value::<Channel>(json!("agent_state")).unwrap(),
            Channel::AgentState
        );
    }

    #[test]
    fn test_unknown_channel_does_not_fail() {
        let channel: Channel = serde_json::from_value(json!("cursor_trail")).unwrap();
        assert_eq!(channel, Channel::Unknown);
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new(
            StreamId::from("session-1"),
            Channel::Chunk,
            json!({"agent_id": "a1", "turn": 0, "text": "Hi"}),
            7,
        );

        assert_eq!(event.offset, 7);
        assert!(Uuid::parse_str(&event.id).is_ok());
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            StreamId::from("session-1"),
            Channel::Terminal,
            json!({"terminal_id": "t", "line": "ls"}),
            0,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stream_id"], "session-1");
        assert_eq!(json["channel"], "terminal");
        assert_eq!(json["offset"], 0);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_decode_chunk() {
        let event = Event::new(
            StreamId::from("s"),
            Channel::Chunk,
            json!({"agent_id": "a1", "turn": 2, "text": "Hello"}),
            0,
        );

        match event.decode().unwrap() {
            EventPayload::Chunk(data) => {
                assert_eq!(data.agent_id, "a1");
                assert_eq!(data.turn, 2);
                assert_eq!(data.text, "Hello");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let result = EventPayload::decode(Channel::Chunk, &json!({"text": 42}));
        assert!(matches!(
            result,
            Err(PayloadError::Invalid {
                channel: "chunk",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_unknown_channel() {
        let result = EventPayload::decode(Channel::Unknown, &json!({}));
        assert!(matches!(result, Err(PayloadError::UnknownChannel)));
    }

    #[test]
    fn test_tool_call_into_parts() {
        let (channel, value) =
            EventPayload::from(ToolCallData::started("call_1", "bash", json!({"cmd": "ls"})))
                .into_parts()
                .unwrap();

        assert_eq!(channel, Channel::ToolCall);
        assert_eq!(value["call_id"], "call_1");
        assert_eq!(value["status"], "running");
        assert_eq!(value["input"]["cmd"], "ls");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn test_terminal_stream_defaults_to_stdout() {
        let data: TerminalData =
            serde_json::from_value(json!({"terminal_id": "t1", "line": "ok"})).unwrap();
        assert_eq!(data.stream, TerminalStream::Stdout);
    }
}
