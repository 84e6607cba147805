//! Ephemeral job broadcaster
//!
//! Non-durable sibling of the stream broker for short-lived background
//! pipelines (repository sync, sandbox provisioning, template builds).
//! History lives in memory for as long as something holds the buffer.
//!
//! - [`JobBuffer`] holds one job's items and wakes subscribers
//! - [`JobSubscription`] replays from an offset then follows live items
//! - [`JobRegistry`] owns buffers by job id with idle expiry and an LRU bound

mod buffer;
mod registry;

pub use buffer::{JobBuffer, JobItem, JobSubscription};
pub use registry::{JobRegistry, JobRegistryConfig};

/// Errors returned by job buffers and the registry
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Job already finished, no more items accepted
    #[error("job finished: {0}")]
    JobFinished(String),

    #[error("job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("job not found: {0}")]
    JobNotFound(String),
}
