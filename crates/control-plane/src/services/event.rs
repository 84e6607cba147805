// Event service
//
// Raw access to session streams: paged reads for polling clients, live
// subscriptions for SSE, and validated appends for client-side producers
// (presence, terminal output, workflow steps).

use serde::Serialize;
use tracing::debug;

use agentdeck_core::{Channel, Event, EventPayload, Offset, StreamId};
use agentdeck_durable::{StreamBroker, Subscription};

use super::ServiceError;

/// Upper bound for a single page of events
pub const MAX_PAGE_SIZE: usize = 1000;

/// One page of a session stream
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub data: Vec<Event>,
    /// Offset to request next
    pub next_offset: Offset,
    /// Whether the stream is closed and `next_offset` is its end
    pub closed: bool,
}

pub struct EventService {
    broker: StreamBroker,
}

impl EventService {
    pub fn new(broker: StreamBroker) -> Self {
        Self { broker }
    }

    /// Read up to `limit` events starting at `from_offset`
    pub async fn list(
        &self,
        session_id: &str,
        from_offset: Offset,
        limit: Option<usize>,
    ) -> Result<EventPage, ServiceError> {
        let stream_id = StreamId::new(session_id);
        let limit = limit
            .unwrap_or(self.broker.config().batch_size)
            .clamp(1, MAX_PAGE_SIZE);

        let head = self
            .broker
            .head(&stream_id)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;
        let data = self
            .broker
            .read(&stream_id, from_offset, limit)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;

        let next_offset = data.last().map(|e| e.offset + 1).unwrap_or(from_offset);
        Ok(EventPage {
            closed: head.closed && next_offset >= head.next_offset,
            next_offset,
            data,
        })
    }

    /// Subscribe to a session stream from `from_offset`
    pub async fn subscribe(
        &self,
        session_id: &str,
        from_offset: Offset,
    ) -> Result<Subscription, ServiceError> {
        self.broker
            .subscribe(&StreamId::new(session_id), from_offset)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))
    }

    /// Validate a client payload against its channel, then append it.
    ///
    /// Clients write presence, terminal and workflow events only. Agent
    /// output goes through the AgentService, and lifecycle channels are owned
    /// by the session and agent services.
    pub async fn emit(
        &self,
        session_id: &str,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<Event, ServiceError> {
        let channel = Channel::parse(channel);
        if !matches!(channel, Channel::Presence | Channel::Terminal | Channel::Workflow) {
            return Err(ServiceError::Invalid(format!(
                "channel '{}' cannot be written by clients",
                channel
            )));
        }
        let payload = EventPayload::decode(channel, &payload)
            .map_err(|e| ServiceError::Invalid(e.to_string()))?;

        let event = self
            .broker
            .publish(&StreamId::new(session_id), payload)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;
        debug!(
            session_id,
            offset = event.offset,
            channel = %event.channel,
            "client event appended"
        );
        Ok(event)
    }
}
