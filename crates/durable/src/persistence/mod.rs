//! Persistence layer for session event streams
//!
//! This module provides:
//! - [`EventLog`] trait for append-only, per-stream event storage
//! - [`InMemoryEventLog`] for development and testing
//! - [`PostgresEventLog`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use store::{EventLog, LogError, StreamHead, StreamSchema};
