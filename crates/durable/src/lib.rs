//! # Durable Session Streams
//!
//! Storage and fan-out for the event-sourced session synchronization system.
//!
//! ## Features
//!
//! - **Append-only event log**: per-stream offsets assigned at append time, PostgreSQL or in-memory
//! - **Subscriber broker**: replay from any offset, then follow live appends without gaps
//! - **Backpressure by pull**: subscribers read batches from the log at their own pace
//! - **Ephemeral jobs**: in-memory replay buffers for short-lived background pipelines
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StreamBroker                          │
//! │  (write front, per-stream wakeup signal, subscriber limits) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EventLog                            │
//! │      (PostgreSQL: event_streams, stream_events)             │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  JobRegistry / JobBuffer                    │
//! │        (in-memory only, idle expiry, LRU bound)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use agentdeck_durable::prelude::*;
//!
//! let broker = StreamBroker::new(Arc::new(InMemoryEventLog::new()), BrokerConfig::default());
//! let session = StreamId::new("session-1");
//! broker.create_stream(&session, StreamSchema::All).await?;
//!
//! let mut subscription = broker.subscribe(&session, 0).await?;
//! broker.publish(&session, ChunkData::new("agent-1", 0, "Hello")).await?;
//!
//! while let Some(event) = subscription.next().await {
//!     println!("{:?}", event?);
//! }
//! ```

pub mod broker;
pub mod jobs;
pub mod persistence;

pub use broker::{BrokerConfig, BrokerError, CancelHandle, StreamBroker, Subscription};
pub use jobs::{JobBuffer, JobError, JobItem, JobRegistry, JobRegistryConfig, JobSubscription};
pub use persistence::{
    EventLog, InMemoryEventLog, LogError, PostgresEventLog, StreamHead, StreamSchema,
};

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{BrokerConfig, BrokerError, StreamBroker, Subscription};
    pub use crate::jobs::{JobBuffer, JobRegistry, JobRegistryConfig};
    pub use crate::persistence::{EventLog, InMemoryEventLog, StreamSchema};
    pub use agentdeck_core::{Channel, ChunkData, Event, EventPayload, Offset, StreamId};
}
