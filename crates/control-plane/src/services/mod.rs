// Services layer
//
// Services own the lifecycle rules and talk to the broker directly. Every
// state change is first accepted by a lifecycle machine, then appended to the
// session stream, and only then committed to the in-memory context.

pub mod agent;
pub mod event;
pub mod job;
pub mod session;
pub mod view;

pub use agent::AgentService;
pub use event::{EventPage, EventService};
pub use job::{JobService, JobUpdate};
pub use session::SessionService;
pub use view::ViewService;

use agentdeck_core::{EventPayload, Rejection, RejectionCode, StreamId};
use agentdeck_durable::{BrokerError, JobError, LogError, StreamBroker};

/// Errors returned by services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Request payload does not fit its channel or operation
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A lifecycle machine refused the event
    #[error("{code}: {message}")]
    Rejected { code: RejectionCode, message: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ServiceError {
    /// Map log-level "missing" and "duplicate" errors onto service variants
    pub(crate) fn from_broker(err: BrokerError, what: impl std::fmt::Display) -> Self {
        match err {
            BrokerError::Log(LogError::StreamNotFound(_)) => {
                ServiceError::NotFound(what.to_string())
            }
            BrokerError::Log(LogError::StreamAlreadyExists(_)) => {
                ServiceError::AlreadyExists(what.to_string())
            }
            other => ServiceError::Broker(other),
        }
    }
}

impl<C> From<Rejection<C>> for ServiceError {
    fn from(rejection: Rejection<C>) -> Self {
        ServiceError::Rejected {
            code: rejection.code,
            message: rejection.message,
        }
    }
}

/// Wall clock in milliseconds since epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Scan a whole stream and keep the last payload `select` accepts. Events
/// that fail to decode are logged and skipped.
pub(crate) async fn replay_latest<T>(
    broker: &StreamBroker,
    stream_id: &StreamId,
    mut select: impl FnMut(EventPayload) -> Option<T>,
) -> Result<Option<T>, BrokerError> {
    let batch_size = broker.config().batch_size;
    let mut latest = None;
    let mut cursor = 0;
    loop {
        let events = broker.read(stream_id, cursor, batch_size).await?;
        let Some(last) = events.last() else { break };
        cursor = last.offset + 1;

        for event in &events {
            match event.decode() {
                Ok(payload) => {
                    if let Some(found) = select(payload) {
                        latest = Some(found);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        stream_id = %stream_id,
                        offset = event.offset,
                        error = %e,
                        "skipping undecodable event"
                    )
                }
            }
        }
    }
    Ok(latest)
}
