// Lifecycle Machines
//
// Pure, synchronous state-transition engines for agents and sessions.
// A machine never performs I/O and never reads a clock: every timestamp it
// needs travels inside the event. Guards run before any context field is
// touched, so a rejection always echoes the caller's context unchanged.
//
// The core does not serialize calls to `send`; the owning service must not
// send concurrently for the same entity.

mod agent;
mod session;

pub use agent::{
    send_agent_event, AgentEvent, AgentLifecycleContext, AgentMachine, AgentRejection,
    AgentStatus, AgentTransition,
};
pub use session::{
    send_session_event, SessionEvent, SessionLifecycleContext, SessionMachine, SessionRejection,
    SessionStatus, SessionTransition, DEFAULT_IDLE_TIMEOUT_MS,
};

use serde::{Deserialize, Serialize};

/// A state machine over a context type.
pub trait LifecycleMachine {
    type State: Copy + Eq + std::fmt::Debug;
    type Context: Clone;
    type Event;

    /// Apply an event. On success returns the next state and context; on
    /// failure returns a rejection carrying the unchanged context.
    fn send(
        context: &Self::Context,
        event: &Self::Event,
    ) -> Result<Transition<Self::State, Self::Context>, Rejection<Self::Context>>;
}

/// Successful transition output
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, C> {
    pub state: S,
    pub context: C,
}

/// Stable rejection codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    AgentToolNotAllowed,
    AgentTurnLimitExceeded,
    AgentInvalidTransition,
    AgentNoTools,
    SessionCapacityReached,
    SessionNotParticipant,
    SessionInvalidTransition,
    SessionNotStale,
    SessionClosed,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::AgentToolNotAllowed => "AGENT_TOOL_NOT_ALLOWED",
            RejectionCode::AgentTurnLimitExceeded => "AGENT_TURN_LIMIT_EXCEEDED",
            RejectionCode::AgentInvalidTransition => "AGENT_INVALID_TRANSITION",
            RejectionCode::AgentNoTools => "AGENT_NO_TOOLS",
            RejectionCode::SessionCapacityReached => "SESSION_CAPACITY_REACHED",
            RejectionCode::SessionNotParticipant => "SESSION_NOT_PARTICIPANT",
            RejectionCode::SessionInvalidTransition => "SESSION_INVALID_TRANSITION",
            RejectionCode::SessionNotStale => "SESSION_NOT_STALE",
            RejectionCode::SessionClosed => "SESSION_CLOSED",
        }
    }
}

impl std::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused transition. `context` is the caller's context, untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection<C> {
    pub code: RejectionCode,
    pub message: String,
    pub context: C,
}

impl<C> Rejection<C> {
    pub(crate) fn new(code: RejectionCode, message: impl Into<String>, context: &C) -> Self
    where
        C: Clone,
    {
        Self {
            code,
            message: message.into(),
            context: context.clone(),
        }
    }
}

impl<C> std::fmt::Display for Rejection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl<C: std::fmt::Debug> std::error::Error for Rejection<C> {}
