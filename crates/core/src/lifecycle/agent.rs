// Agent run lifecycle
//
// idle -> running -> (paused | completed | error | idle)
// completed/error can be restarted with START.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{LifecycleMachine, Rejection, RejectionCode, Transition};
use crate::error::ErrorValue;

/// Agent run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Paused => write!(f, "paused"),
            AgentStatus::Completed => write!(f, "completed"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Agent lifecycle context.
///
/// `current_turn <= max_turns` holds while running. `task_id` is only set
/// while running or paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLifecycleContext {
    pub status: AgentStatus,
    pub current_turn: u32,
    pub max_turns: u32,
    pub allowed_tools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
}

impl AgentLifecycleContext {
    /// Fresh idle context
    pub fn new<I, T>(max_turns: u32, allowed_tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            status: AgentStatus::Idle,
            current_turn: 0,
            max_turns,
            allowed_tools: allowed_tools.into_iter().map(Into::into).collect(),
            task_id: None,
            error: None,
        }
    }

    /// Whether a START is needed before the agent can do work again
    pub fn is_finished(&self) -> bool {
        matches!(self.status, AgentStatus::Completed | AgentStatus::Error)
    }
}

/// Events accepted by the agent machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    /// Begin a run for a task. `allowed_tools` replaces the tool set when present.
    Start {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<BTreeSet<String>>,
    },
    /// Advance one turn, optionally using a tool
    Step {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    Pause,
    Resume,
    Complete,
    Abort,
    Error {
        error: ErrorValue,
    },
}

impl AgentEvent {
    pub fn start(task_id: impl Into<String>) -> Self {
        AgentEvent::Start {
            task_id: task_id.into(),
            allowed_tools: None,
        }
    }

    pub fn step() -> Self {
        AgentEvent::Step { tool: None }
    }

    pub fn step_with_tool(tool: impl Into<String>) -> Self {
        AgentEvent::Step {
            tool: Some(tool.into()),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        AgentEvent::Error {
            error: ErrorValue::new(code, message),
        }
    }

    /// Event name as used in rejection messages
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Start { .. } => "START",
            AgentEvent::Step { .. } => "STEP",
            AgentEvent::Pause => "PAUSE",
            AgentEvent::Resume => "RESUME",
            AgentEvent::Complete => "COMPLETE",
            AgentEvent::Abort => "ABORT",
            AgentEvent::Error { .. } => "ERROR",
        }
    }

    /// Tool this event wants to use, if any
    pub fn tool(&self) -> Option<&str> {
        match self {
            AgentEvent::Step { tool } => tool.as_deref(),
            _ => None,
        }
    }
}

pub type AgentTransition = Transition<AgentStatus, AgentLifecycleContext>;
pub type AgentRejection = Rejection<AgentLifecycleContext>;

/// The agent lifecycle machine
pub struct AgentMachine;

impl LifecycleMachine for AgentMachine {
    type State = AgentStatus;
    type Context = AgentLifecycleContext;
    type Event = AgentEvent;

    fn send(
        context: &AgentLifecycleContext,
        event: &AgentEvent,
    ) -> Result<AgentTransition, AgentRejection> {
        // Tool permission is checked before the state switch, in every state.
        if let Some(tool) = event.tool() {
            if !context.allowed_tools.contains(tool) {
                return Err(Rejection::new(
                    RejectionCode::AgentToolNotAllowed,
                    format!("tool '{}' is not allowed for this agent", tool),
                    context,
                ));
            }
        }

        let next = match (context.status, event) {
            (
                AgentStatus::Idle | AgentStatus::Completed | AgentStatus::Error,
                AgentEvent::Start {
                    task_id,
                    allowed_tools,
                },
            ) => {
                let tools = allowed_tools
                    .clone()
                    .unwrap_or_else(|| context.allowed_tools.clone());
                if tools.is_empty() {
                    return Err(Rejection::new(
                        RejectionCode::AgentNoTools,
                        "cannot start an agent with an empty tool set",
                        context,
                    ));
                }
                AgentLifecycleContext {
                    status: AgentStatus::Running,
                    current_turn: 0,
                    max_turns: context.max_turns,
                    allowed_tools: tools,
                    task_id: Some(task_id.clone()),
                    error: None,
                }
            }
            (AgentStatus::Running, AgentEvent::Step { .. }) => {
                let turn = context
                    .current_turn
                    .checked_add(1)
                    .filter(|turn| *turn <= context.max_turns)
                    .ok_or_else(|| {
                        Rejection::new(
                            RejectionCode::AgentTurnLimitExceeded,
                            format!("turn limit of {} reached", context.max_turns),
                            context,
                        )
                    })?;
                AgentLifecycleContext {
                    current_turn: turn,
                    ..context.clone()
                }
            }
            (AgentStatus::Running, AgentEvent::Pause) => AgentLifecycleContext {
                status: AgentStatus::Paused,
                ..context.clone()
            },
            (AgentStatus::Running, AgentEvent::Complete) => AgentLifecycleContext {
                status: AgentStatus::Completed,
                task_id: None,
                ..context.clone()
            },
            (AgentStatus::Running | AgentStatus::Paused, AgentEvent::Abort) => {
                AgentLifecycleContext {
                    status: AgentStatus::Idle,
                    task_id: None,
                    ..context.clone()
                }
            }
            (AgentStatus::Running, AgentEvent::Error { error }) => AgentLifecycleContext {
                status: AgentStatus::Error,
                task_id: None,
                error: Some(error.clone()),
                ..context.clone()
            },
            (AgentStatus::Paused, AgentEvent::Resume) => AgentLifecycleContext {
                status: AgentStatus::Running,
                ..context.clone()
            },
            (status, event) => {
                return Err(Rejection::new(
                    RejectionCode::AgentInvalidTransition,
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

/// Apply an agent event, returning only the new context
pub fn send_agent_event(
    context: &AgentLifecycleContext,
    event: &AgentEvent,
) -> Result<AgentLifecycleContext, AgentRejection> {
    AgentMachine::send(context, event).map(|transition| transition.context)
}
