// Projection Engine
//
// Folds the replayed + live event sequence of one or more streams into
// materialized, queryable views. Every row is keyed on a natural id and carries
// the offset it was last written at, so applying the same event twice (replay
// overlap after a reconnect) leaves the views unchanged.
//
// A projection instance is private to its owner. Share it behind a lock.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{trace, warn};

use crate::events::{
    AgentStateData, ChunkData, Event, EventPayload, Offset, PresenceData, SessionStatusData,
    StreamId, TerminalData, TerminalStream, ToolCallData, ToolCallStatus, WorkflowData,
    WorkflowStepStatus,
};
use crate::lifecycle::{AgentLifecycleContext, SessionLifecycleContext};

/// Result of folding one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// At least one view changed
    Applied,
    /// The target row already reflects this offset or a newer one
    Duplicate,
    /// Presence write older than the stored `last_seen`
    Superseded,
    /// Channel unknown to this build
    Ignored,
    /// Payload did not match the channel schema
    Skipped,
}

// ============================================================================
// View rows
// ============================================================================

/// Accumulated message text for one agent turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub stream_id: StreamId,
    pub agent_id: String,
    pub turn: u32,
    pub text: String,
    pub chunk_count: usize,
    pub first_offset: Offset,
    pub last_offset: Offset,
}

#[derive(Debug, Clone, Default)]
struct MessageRow {
    chunks: BTreeMap<Offset, String>,
    text: String,
}

impl MessageRow {
    /// Insert a chunk. Returns false if this offset was already folded in.
    fn insert(&mut self, offset: Offset, text: String) -> bool {
        if self.chunks.contains_key(&offset) {
            return false;
        }
        let in_order = self
            .chunks
            .keys()
            .next_back()
            .map_or(true, |last| offset > *last);
        if in_order {
            self.text.push_str(&text);
            self.chunks.insert(offset, text);
        } else {
            self.chunks.insert(offset, text);
            self.text = self.chunks.values().map(String::as_str).collect();
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallView {
    pub call_id: String,
    pub stream_id: StreamId,
    pub tool_name: String,
    pub status: ToolCallStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub first_offset: Offset,
    pub last_offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceView {
    pub user_id: String,
    pub last_seen: i64,
    pub cursor: Option<serde_json::Value>,
    pub offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalLine {
    pub terminal_id: String,
    pub stream: TerminalStream,
    pub line: String,
    pub offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStepView {
    pub workflow_id: String,
    pub step: String,
    pub status: WorkflowStepStatus,
    pub detail: Option<serde_json::Value>,
    pub stream_id: StreamId,
    pub first_offset: Offset,
    pub last_offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStateView {
    pub agent_id: String,
    pub stream_id: StreamId,
    pub context: AgentLifecycleContext,
    pub offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStateView {
    pub session_id: String,
    pub stream_id: StreamId,
    pub context: SessionLifecycleContext,
    pub offset: Offset,
}

/// Whether an incoming write at (`stream`, `offset`) is not newer than a row
/// last written at (`row_stream`, `row_offset`). Offsets are only comparable
/// within one stream.
fn not_newer(row_stream: &StreamId, row_offset: Offset, stream: &StreamId, offset: Offset) -> bool {
    row_stream == stream && offset <= row_offset
}

// ============================================================================
// SessionProjection
// ============================================================================

/// Materialized views over one or more event streams
#[derive(Debug, Clone, Default)]
pub struct SessionProjection {
    messages: HashMap<(StreamId, String, u32), MessageRow>,
    tool_calls: HashMap<String, ToolCallView>,
    presence: HashMap<(StreamId, String), PresenceView>,
    terminal: BTreeMap<(StreamId, Offset), TerminalLine>,
    workflow_steps: HashMap<(String, String), WorkflowStepView>,
    agents: HashMap<String, AgentStateView>,
    sessions: HashMap<String, SessionStateView>,
    last_applied: HashMap<StreamId, Offset>,
}

impl SessionProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild views from a slice of events
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut projection = Self::new();
        for event in events {
            projection.apply(event);
        }
        projection
    }

    /// Fold one event into the views
    pub fn apply(&mut self, event: &Event) -> ApplyOutcome {
        let outcome = match event.decode() {
            Ok(payload) => self.apply_payload(event, payload),
            Err(crate::error::PayloadError::UnknownChannel) => {
                trace!(
                    stream_id = %event.stream_id,
                    offset = event.offset,
                    "Ignoring event on unknown channel"
                );
                ApplyOutcome::Ignored
            }
            Err(e) => {
                warn!(
                    stream_id = %event.stream_id,
                    offset = event.offset,
                    channel = %event.channel,
                    error = %e,
                    "Projection drift: skipping undecodable event"
                );
                ApplyOutcome::Skipped
            }
        };

        let last = self.last_applied.entry(event.stream_id.clone()).or_insert(event.offset);
        if event.offset > *last {
            *last = event.offset;
        }

        outcome
    }

    fn apply_payload(&mut self, event: &Event, payload: EventPayload) -> ApplyOutcome {
        match payload {
            EventPayload::Chunk(data) => self.apply_chunk(event, data),
            EventPayload::ToolCall(data) => self.apply_tool_call(event, data),
            EventPayload::Presence(data) => self.apply_presence(event, data),
            EventPayload::Terminal(data) => self.apply_terminal(event, data),
            EventPayload::Workflow(data) => self.apply_workflow(event, data),
            EventPayload::AgentState(data) => self.apply_agent_state(event, data),
            EventPayload::Status(data) => self.apply_session_status(event, data),
        }
    }

    fn apply_chunk(&mut self, event: &Event, data: ChunkData) -> ApplyOutcome {
        let row = self
            .messages
            .entry((event.stream_id.clone(), data.agent_id, data.turn))
            .or_default();
        if row.insert(event.offset, data.text) {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Duplicate
        }
    }

    fn apply_tool_call(&mut self, event: &Event, data: ToolCallData) -> ApplyOutcome {
        match self.tool_calls.get_mut(&data.call_id) {
            Some(row) => {
                if not_newer(&row.stream_id, row.last_offset, &event.stream_id, event.offset) {
                    return ApplyOutcome::Duplicate;
                }
                row.tool_name = data.tool_name;
                row.status = data.status;
                if data.input.is_some() {
                    row.input = data.input;
                }
                if data.output.is_some() {
                    row.output = data.output;
                }
                if data.error.is_some() {
                    row.error = data.error;
                }
                row.stream_id = event.stream_id.clone();
                row.last_offset = event.offset;
            }
            None => {
                self.tool_calls.insert(
                    data.call_id.clone(),
                    ToolCallView {
                        call_id: data.call_id,
                        stream_id: event.stream_id.clone(),
                        tool_name: data.tool_name,
                        status: data.status,
                        input: data.input,
                        output: data.output,
                        error: data.error,
                        first_offset: event.offset,
                        last_offset: event.offset,
                    },
                );
            }
        }
        ApplyOutcome::Applied
    }

    fn apply_presence(&mut self, event: &Event, data: PresenceData) -> ApplyOutcome {
        let key = (event.stream_id.clone(), data.user_id.clone());
        if let Some(row) = self.presence.get(&key) {
            if event.offset <= row.offset {
                return ApplyOutcome::Duplicate;
            }
            if data.last_seen < row.last_seen {
                return ApplyOutcome::Superseded;
            }
        }
        self.presence.insert(
            key,
            PresenceView {
                user_id: data.user_id,
                last_seen: data.last_seen,
                cursor: data.cursor,
                offset: event.offset,
            },
        );
        ApplyOutcome::Applied
    }

    fn apply_terminal(&mut self, event: &Event, data: TerminalData) -> ApplyOutcome {
        let key = (event.stream_id.clone(), event.offset);
        if self.terminal.contains_key(&key) {
            return ApplyOutcome::Duplicate;
        }
        self.terminal.insert(
            key,
            TerminalLine {
                terminal_id: data.terminal_id,
                stream: data.stream,
                line: data.line,
                offset: event.offset,
            },
        );
        ApplyOutcome::Applied
    }

    fn apply_workflow(&mut self, event: &Event, data: WorkflowData) -> ApplyOutcome {
        let key = (data.workflow_id.clone(), data.step.clone());
        let first_offset = match self.workflow_steps.get(&key) {
            Some(row) => {
                if not_newer(&row.stream_id, row.last_offset, &event.stream_id, event.offset) {
                    return ApplyOutcome::Duplicate;
                }
                row.first_offset
            }
            None => event.offset,
        };
        self.workflow_steps.insert(
            key,
            WorkflowStepView {
                workflow_id: data.workflow_id,
                step: data.step,
                status: data.status,
                detail: data.detail,
                stream_id: event.stream_id.clone(),
                first_offset,
                last_offset: event.offset,
            },
        );
        ApplyOutcome::Applied
    }

    fn apply_agent_state(&mut self, event: &Event, data: AgentStateData) -> ApplyOutcome {
        if let Some(row) = self.agents.get(&data.agent_id) {
            if not_newer(&row.stream_id, row.offset, &event.stream_id, event.offset) {
                return ApplyOutcome::Duplicate;
            }
        }
        self.agents.insert(
            data.agent_id.clone(),
            AgentStateView {
                agent_id: data.agent_id,
                stream_id: event.stream_id.clone(),
                context: data.context,
                offset: event.offset,
            },
        );
        ApplyOutcome::Applied
    }

    fn apply_session_status(&mut self, event: &Event, data: SessionStatusData) -> ApplyOutcome {
        if let Some(row) = self.sessions.get(&data.session_id) {
            if not_newer(&row.stream_id, row.offset, &event.stream_id, event.offset) {
                return ApplyOutcome::Duplicate;
            }
        }
        self.sessions.insert(
            data.session_id.clone(),
            SessionStateView {
                session_id: data.session_id,
                stream_id: event.stream_id.clone(),
                context: data.context,
                offset: event.offset,
            },
        );
        ApplyOutcome::Applied
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Messages of a stream, ordered by their first chunk
    pub fn messages(&self, stream_id: &StreamId) -> Vec<MessageView> {
        let mut views: Vec<MessageView> = self
            .messages
            .iter()
            .filter(|((stream, _, _), _)| stream == stream_id)
            .filter_map(|((stream, agent_id, turn), row)| {
                message_view(stream, agent_id, *turn, row)
            })
            .collect();
        views.sort_by_key(|view| view.first_offset);
        views
    }

    pub fn message(&self, stream_id: &StreamId, agent_id: &str, turn: u32) -> Option<MessageView> {
        let key = (stream_id.clone(), agent_id.to_string(), turn);
        self.messages
            .get(&key)
            .and_then(|row| message_view(stream_id, agent_id, turn, row))
    }

    /// Tool calls of a stream, ordered by first appearance
    pub fn tool_calls(&self, stream_id: &StreamId) -> Vec<ToolCallView> {
        let mut views: Vec<ToolCallView> = self
            .tool_calls
            .values()
            .filter(|view| &view.stream_id == stream_id)
            .cloned()
            .collect();
        views.sort_by_key(|view| view.first_offset);
        views
    }

    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallView> {
        self.tool_calls.get(call_id)
    }

    /// Presence rows of a stream, most recently seen first
    pub fn presence(&self, stream_id: &StreamId) -> Vec<PresenceView> {
        let mut views: Vec<PresenceView> = self
            .presence
            .iter()
            .filter(|((stream, _), _)| stream == stream_id)
            .map(|(_, view)| view.clone())
            .collect();
        views.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        views
    }

    /// Terminal lines of a stream in offset order
    pub fn terminal(&self, stream_id: &StreamId) -> Vec<TerminalLine> {
        self.terminal
            .range((stream_id.clone(), 0)..=(stream_id.clone(), Offset::MAX))
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Steps of a workflow, ordered by first appearance
    pub fn workflow_steps(&self, workflow_id: &str) -> Vec<WorkflowStepView> {
        let mut views: Vec<WorkflowStepView> = self
            .workflow_steps
            .values()
            .filter(|view| view.workflow_id == workflow_id)
            .cloned()
            .collect();
        views.sort_by_key(|view| view.first_offset);
        views
    }

    pub fn agent_state(&self, agent_id: &str) -> Option<&AgentStateView> {
        self.agents.get(agent_id)
    }

    /// Latest agent states recorded on a stream
    pub fn agent_states(&self, stream_id: &StreamId) -> Vec<AgentStateView> {
        let mut views: Vec<AgentStateView> = self
            .agents
            .values()
            .filter(|view| &view.stream_id == stream_id)
            .cloned()
            .collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    pub fn session_state(&self, session_id: &str) -> Option<&SessionStateView> {
        self.sessions.get(session_id)
    }

    /// Highest offset folded in for a stream
    pub fn last_applied(&self, stream_id: &StreamId) -> Option<Offset> {
        self.last_applied.get(stream_id).copied()
    }
}

fn message_view(
    stream_id: &StreamId,
    agent_id: &str,
    turn: u32,
    row: &MessageRow,
) -> Option<MessageView> {
    let first_offset = *row.chunks.keys().next()?;
    let last_offset = *row.chunks.keys().next_back()?;
    Some(MessageView {
        stream_id: stream_id.clone(),
        agent_id: agent_id.to_string(),
        turn,
        text: row.text.clone(),
        chunk_count: row.chunks.len(),
        first_offset,
        last_offset,
    })
}

/// Functional form of [`SessionProjection::apply`]
pub fn project(mut state: SessionProjection, event: &Event) -> SessionProjection {
    state.apply(event);
    state
}
