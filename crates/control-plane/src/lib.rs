// Agentdeck Control Plane Library
// Decision: Shared library for the API server binary and integration tests

// API routes and types
pub mod api;

// Environment configuration
pub mod config;

// Services layer
pub mod services;
pub use services::{AgentService, EventService, JobService, SessionService, ViewService};
