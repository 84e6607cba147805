// Session lifecycle
//
// idle -> initializing -> active <-> paused
//                           |         |
//                           +--> closing --> closed
// Any non-closed state may move to error; error can only be closed.

use serde::{Deserialize, Serialize};

use super::{LifecycleMachine, Rejection, RejectionCode, Transition};
use crate::error::ErrorValue;

/// Default staleness threshold for TIMEOUT (30 minutes)
pub const DEFAULT_IDLE_TIMEOUT_MS: i64 = 30 * 60 * 1000;

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Initializing,
    Active,
    Paused,
    Closing,
    Closed,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Initializing => write!(f, "initializing"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Closing => write!(f, "closing"),
            SessionStatus::Closed => write!(f, "closed"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Session lifecycle context.
///
/// `participants` keeps join order and never holds more than
/// `max_participants` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLifecycleContext {
    pub status: SessionStatus,
    pub participants: Vec<String>,
    pub max_participants: u32,
    /// Milliseconds since epoch of the last JOIN/LEAVE/HEARTBEAT/RESUME
    pub last_activity: i64,
    pub idle_timeout_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
}

impl SessionLifecycleContext {
    pub fn new(max_participants: u32, created_at: i64) -> Self {
        Self {
            status: SessionStatus::Idle,
            participants: Vec::new(),
            max_participants,
            last_activity: created_at,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            error: None,
        }
    }

    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: i64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants as usize
    }

    /// Whether a TIMEOUT observed at `now` would be honored
    pub fn is_stale(&self, now: i64) -> bool {
        now.saturating_sub(self.last_activity) > self.idle_timeout_ms
    }
}

/// Events accepted by the session machine. Timestamps are supplied by the
/// caller in milliseconds since epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    Initialize { at: i64 },
    Ready { at: i64 },
    Join { user_id: String, at: i64 },
    Leave { user_id: String, at: i64 },
    Heartbeat { at: i64 },
    Pause,
    Resume { at: i64 },
    Timeout { now: i64 },
    Close,
    Error { error: ErrorValue },
}

impl SessionEvent {
    pub fn join(user_id: impl Into<String>, at: i64) -> Self {
        SessionEvent::Join {
            user_id: user_id.into(),
            at,
        }
    }

    pub fn leave(user_id: impl Into<String>, at: i64) -> Self {
        SessionEvent::Leave {
            user_id: user_id.into(),
            at,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        SessionEvent::Error {
            error: ErrorValue::new(code, message),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Initialize { .. } => "INITIALIZE",
            SessionEvent::Ready { .. } => "READY",
            SessionEvent::Join { .. } => "JOIN",
            SessionEvent::Leave { .. } => "LEAVE",
            SessionEvent::Heartbeat { .. } => "HEARTBEAT",
            SessionEvent::Pause => "PAUSE",
            SessionEvent::Resume { .. } => "RESUME",
            SessionEvent::Timeout { .. } => "TIMEOUT",
            SessionEvent::Close => "CLOSE",
            SessionEvent::Error { .. } => "ERROR",
        }
    }
}

pub type SessionTransition = Transition<SessionStatus, SessionLifecycleContext>;
pub type SessionRejection = Rejection<SessionLifecycleContext>;

/// The session lifecycle machine
pub struct SessionMachine;

impl LifecycleMachine for SessionMachine {
    type State = SessionStatus;
    type Context = SessionLifecycleContext;
    type Event = SessionEvent;

    fn send(
        context: &SessionLifecycleContext,
        event: &SessionEvent,
    ) -> Result<SessionTransition, SessionRejection> {
        if context.status == SessionStatus::Closed {
            return Err(Rejection::new(
                RejectionCode::SessionClosed,
                format!("{} rejected: session is closed", event.name()),
                context,
            ));
        }

        let next = match (context.status, event) {
            (SessionStatus::Idle, SessionEvent::Initialize { at }) => SessionLifecycleContext {
                status: SessionStatus::Initializing,
                last_activity: *at,
                ..context.clone()
            },
            (SessionStatus::Initializing, SessionEvent::Ready { at }) => {
                SessionLifecycleContext {
                    status: SessionStatus::Active,
                    last_activity: *at,
                    ..context.clone()
                }
            }
            (SessionStatus::Active, SessionEvent::Join { user_id, at }) => {
                let mut participants = context.participants.clone();
                if !context.is_participant(user_id) {
                    if context.is_full() {
                        return Err(Rejection::new(
                            RejectionCode::SessionCapacityReached,
                            format!(
                                "session is full ({} of {} participants)",
                                context.participants.len(),
                                context.max_participants
                            ),
                            context,
                        ));
                    }
                    participants.push(user_id.clone());
                }
                SessionLifecycleContext {
                    participants,
                    last_activity: *at,
                    ..context.clone()
                }
            }
            (SessionStatus::Active, SessionEvent::Leave { user_id, at }) => {
                if !context.is_participant(user_id) {
                    return Err(Rejection::new(
                        RejectionCode::SessionNotParticipant,
                        format!("user '{}' is not a participant", user_id),
                        context,
                    ));
                }
                SessionLifecycleContext {
                    participants: context
                        .participants
                        .iter()
                        .filter(|p| *p != user_id)
                        .cloned()
                        .collect(),
                    last_activity: *at,
                    ..context.clone()
                }
            }
            (SessionStatus::Active, SessionEvent::Heartbeat { at }) => SessionLifecycleContext {
                last_activity: *at,
                ..context.clone()
            },
            (SessionStatus::Active, SessionEvent::Pause) => SessionLifecycleContext {
                status: SessionStatus::Paused,
                ..context.clone()
            },
            (SessionStatus::Active, SessionEvent::Timeout { now }) => {
                if !context.is_stale(*now) {
                    return Err(Rejection::new(
                        RejectionCode::SessionNotStale,
                        format!(
                            "last activity {}ms ago is within the {}ms idle timeout",
                            now.saturating_sub(context.last_activity),
                            context.idle_timeout_ms
                        ),
                        context,
                    ));
                }
                SessionLifecycleContext {
                    status: SessionStatus::Closing,
                    ..context.clone()
                }
            }
            (SessionStatus::Active | SessionStatus::Paused, SessionEvent::Close) => {
                SessionLifecycleContext {
                    status: SessionStatus::Closing,
                    ..context.clone()
                }
            }
            (SessionStatus::Paused, SessionEvent::Resume { at }) => SessionLifecycleContext {
                status: SessionStatus::Active,
                last_activity: *at,
                ..context.clone()
            },
            (SessionStatus::Closing | SessionStatus::Error, SessionEvent::Close) => {
                SessionLifecycleContext {
                    status: SessionStatus::Closed,
                    ..context.clone()
                }
            }
            (_, SessionEvent::Error { error }) => SessionLifecycleContext {
                status: SessionStatus::Error,
                error: Some(error.clone()),
                ..context.clone()
            },
            (status, event) => {
                return Err(Rejection::new(
                    RejectionCode::SessionInvalidTransition,
                    format!("{} is not allowed while {}", event.name(), status),
                    context,
                ));
            }
        };

        Ok(Transition {
            state: next.status,
            context: next,
        })
    }
}

/// Apply a session event, returning only the new context
pub fn send_session_event(
    context: &SessionLifecycleContext,
    event: &SessionEvent,
) -> Result<SessionLifecycleContext, SessionRejection> {
    SessionMachine::send(context, event).map(|transition| transition.context)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(max_participants: u32) -> SessionLifecycleContext {
        let context = SessionLifecycleContext::new(max_participants, 1_000);
        let context =
            send_session_event(&context, &SessionEvent::Initialize { at: 1_000 }).unwrap();
        send_session_event(&context, &SessionEvent::Ready { at: 2_000 }).unwrap()
    }

    #[test]
    fn test_initialize_then_ready() {
        let context = SessionLifecycleContext::new(4, 0);
        let transition =
            SessionMachine::send(&context, &SessionEvent::Initialize { at: 10 }).unwrap();
        assert_eq!(transition.state, SessionStatus::Initializing);

        let transition =
            SessionMachine::send(&transition.context, &SessionEvent::Ready { at: 20 }).unwrap();
        assert_eq!(transition.state, SessionStatus::Active);
        assert_eq!(transition.context.last_activity, 20);
    }

    #[test]
    fn test_capacity_scenario() {
        let context = active(2);
        let context = send_session_event(&context, &SessionEvent::join("u1", 3_000)).unwrap();
        let context = send_session_event(&context, &SessionEvent::join("u2", 4_000)).unwrap();
        assert_eq!(context.participants, vec!["u1", "u2"]);

        let rejection = send_session_event(&context, &SessionEvent::join("u3", 5_000)).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionCapacityReached);
        assert_eq!(rejection.code.as_str(), "SESSION_CAPACITY_REACHED");
        assert_eq!(rejection.context.participants, vec!["u1", "u2"]);
        assert_eq!(rejection.context.last_activity, 4_000);
    }

    #[test]
    fn test_join_twice_is_noop() {
        let context = active(1);
        let context = send_session_event(&context, &SessionEvent::join("u1", 3_000)).unwrap();
        // Full, but u1 is already in
        let context = send_session_event(&context, &SessionEvent::join("u1", 3_500)).unwrap();
        assert_eq!(context.participants, vec!["u1"]);
    }

    #[test]
    fn test_leave() {
        let context = active(3);
        let context = send_session_event(&context, &SessionEvent::join("u1", 3_000)).unwrap();
        let context = send_session_event(&context, &SessionEvent::join("u2", 3_000)).unwrap();
        let context = send_session_event(&context, &SessionEvent::leave("u1", 4_000)).unwrap();
        assert_eq!(context.participants, vec!["u2"]);
        assert_eq!(context.last_activity, 4_000);

        let rejection =
            send_session_event(&context, &SessionEvent::leave("u1", 5_000)).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionNotParticipant);
        assert_eq!(rejection.context, context);
    }

    #[test]
    fn test_heartbeat_only_touches_activity() {
        let context = active(2);
        let next = send_session_event(&context, &SessionEvent::Heartbeat { at: 9_000 }).unwrap();
        assert_eq!(next.last_activity, 9_000);
        assert_eq!(next.status, context.status);
        assert_eq!(next.participants, context.participants);
    }

    #[test]
    fn test_timeout_requires_staleness() {
        let context = active(2).with_idle_timeout_ms(1_000);

        let rejection =
            send_session_event(&context, &SessionEvent::Timeout { now: 2_500 }).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionNotStale);

        // Exactly at the threshold is not yet stale
        let rejection =
            send_session_event(&context, &SessionEvent::Timeout { now: 3_000 }).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionNotStale);

        let next = send_session_event(&context, &SessionEvent::Timeout { now: 3_001 }).unwrap();
        assert_eq!(next.status, SessionStatus::Closing);
    }

    #[test]
    fn test_pause_resume_close() {
        let paused = send_session_event(&active(2), &SessionEvent::Pause).unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        let rejection =
            send_session_event(&paused, &SessionEvent::join("u1", 1)).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionInvalidTransition);

        let resumed = send_session_event(&paused, &SessionEvent::Resume { at: 7_000 }).unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        assert_eq!(resumed.last_activity, 7_000);

        let closing = send_session_event(&paused, &SessionEvent::Close).unwrap();
        assert_eq!(closing.status, SessionStatus::Closing);
        let closed = send_session_event(&closing, &SessionEvent::Close).unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
    }

    #[test]
    fn test_closed_is_terminal() {
        let closing = send_session_event(&active(2), &SessionEvent::Close).unwrap();
        let closed = send_session_event(&closing, &SessionEvent::Close).unwrap();

        for event in [
            SessionEvent::Close,
            SessionEvent::join("u1", 1),
            SessionEvent::error("X", "y"),
            SessionEvent::Initialize { at: 1 },
        ] {
            let rejection = send_session_event(&closed, &event).unwrap_err();
            assert_eq!(rejection.code, RejectionCode::SessionClosed);
            assert_eq!(rejection.context, closed);
        }
    }

    #[test]
    fn test_error_from_any_open_state() {
        let idle = SessionLifecycleContext::new(2, 0);
        let errored =
            send_session_event(&idle, &SessionEvent::error("BOOM", "sandbox lost")).unwrap();
        assert_eq!(errored.status, SessionStatus::Error);
        assert_eq!(errored.error.as_ref().unwrap().code, "BOOM");

        let rejection = send_session_event(&errored, &SessionEvent::Pause).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionInvalidTransition);

        let closed = send_session_event(&errored, &SessionEvent::Close).unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
    }

    #[test]
    fn test_invalid_transition_from_idle() {
        let context = SessionLifecycleContext::new(2, 0);
        let rejection = send_session_event(&context, &SessionEvent::Close).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SessionInvalidTransition);
        assert_eq!(
            rejection.to_string(),
            "SESSION_INVALID_TRANSITION: CLOSE is not allowed while idle"
        );
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(SessionEvent::join("u1", 5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "JOIN", "user_id": "u1", "at": 5}));

        let event: SessionEvent =
            serde_json::from_value(serde_json::json!({"type": "CLOSE"})).unwrap();
        assert_eq!(event, SessionEvent::Close);
    }
}
