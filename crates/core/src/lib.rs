// Session Sync Core
//
// DB-agnostic building blocks of the event-sourced session synchronization
// system: the event model, the lifecycle machines that gate every state
// mutation, and the projection engine that turns event streams into views.
//
// Key design decisions:
// - Offsets are assigned by the event log; this crate only carries them
// - Lifecycle machines are pure: no I/O, no clock, rejection leaves context untouched
// - Payloads travel as JSON and decode into a closed enum per channel
// - Projections are idempotent: natural-key rows guarded by offset

pub mod error;
pub mod events;
pub mod lifecycle;
pub mod projection;
pub mod telemetry;

pub use error::{ErrorValue, PayloadError};
pub use events::{
    AgentStateData, Channel, ChunkData, Event, EventPayload, Offset, PresenceData,
    SessionStatusData, StreamId, TerminalData, TerminalStream, ToolCallData, ToolCallStatus,
    WorkflowData, WorkflowStepStatus,
};
pub use lifecycle::{
    send_agent_event, send_session_event, AgentEvent, AgentLifecycleContext, AgentMachine,
    AgentRejection, AgentStatus, LifecycleMachine, Rejection, RejectionCode, SessionEvent,
    SessionLifecycleContext, SessionMachine, SessionRejection, SessionStatus, Transition,
};
pub use projection::{
    project, AgentStateView, ApplyOutcome, MessageView, PresenceView, SessionProjection,
    SessionStateView, TerminalLine, ToolCallView, WorkflowStepView,
};
