// HTTP API routes
//
// Each submodule handles one resource and exposes `routes(state)`. All of
// them share one AppState holding the services.

pub mod agents;
pub mod common;
pub mod events;
pub mod jobs;
pub mod sessions;
pub mod views;

use std::sync::Arc;

use axum::Router;

use agentdeck_durable::StreamBroker;

use crate::config::ServerConfig;
use crate::services::{AgentService, EventService, JobService, SessionService, ViewService};

// Re-export common types
pub use common::{ApiError, ErrorResponse, ListResponse};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub agents: Arc<AgentService>,
    pub events: Arc<EventService>,
    pub views: Arc<ViewService>,
    pub jobs: Arc<JobService>,
    pub default_max_participants: u32,
    pub default_max_turns: u32,
}

impl AppState {
    pub fn new(broker: StreamBroker, config: &ServerConfig) -> Self {
        let agents = Arc::new(AgentService::new(broker.clone()));
        Self {
            sessions: Arc::new(SessionService::new(broker.clone()).with_agents(agents.clone())),
            agents,
            events: Arc::new(EventService::new(broker.clone())),
            views: Arc::new(ViewService::new(broker)),
            jobs: Arc::new(JobService::new(config.jobs.clone())),
            default_max_participants: config.default_max_participants,
            default_max_turns: config.default_max_turns,
        }
    }
}

/// All /v1 routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(sessions::routes(state.clone()))
        .merge(agents::routes(state.clone()))
        .merge(events::routes(state.clone()))
        .merge(views::routes(state.clone()))
        .merge(jobs::routes(state))
}
