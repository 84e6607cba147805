//! In-memory EventLog for development and tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use agentdeck_core::{Channel, Event, Offset, StreamId};

use super::store::{EventLog, LogError, StreamHead, StreamSchema};

#[derive(Debug, Default)]
struct StreamState {
    schema: StreamSchema,
    events: Vec<Event>,
    closed: bool,
}

/// In-memory event log
///
/// The stream table lock is held only for lookup and insert; each stream
/// has its own mutex that serializes appends to it.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    streams: RwLock<HashMap<StreamId, Arc<Mutex<StreamState>>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, stream_id: &StreamId) -> Result<Arc<Mutex<StreamState>>, LogError> {
        self.streams
            .read()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| LogError::StreamNotFound(stream_id.clone()))
    }

    /// Number of streams (for tests)
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn create_stream(
        &self,
        stream_id: &StreamId,
        schema: StreamSchema,
    ) -> Result<(), LogError> {
        let mut streams = self.streams.write();
        if streams.contains_key(stream_id) {
            return Err(LogError::StreamAlreadyExists(stream_id.clone()));
        }
        streams.insert(
            stream_id.clone(),
            Arc::new(Mutex::new(StreamState {
                schema,
                ..Default::default()
            })),
        );
        debug!(%stream_id, "created stream");
        Ok(())
    }

    async fn append(
        &self,
        stream_id: &StreamId,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Result<Event, LogError> {
        let stream = self.stream(stream_id)?;
        let mut state = stream.lock();

        if state.closed {
            return Err(LogError::StreamClosed(stream_id.clone()));
        }
        if !state.schema.allows(channel) {
            return Err(LogError::ChannelNotAllowed {
                stream_id: stream_id.clone(),
                channel,
            });
        }

        let offset = state.events.len() as Offset;
        let event = Event::new(stream_id.clone(), channel, payload, offset);
        state.events.push(event.clone());
        Ok(event)
    }

    async fn read(
        &self,
        stream_id: &StreamId,
        from_offset: Offset,
        limit: usize,
    ) -> Result<Vec<Event>, LogError> {
        let stream = self.stream(stream_id)?;
        let state = stream.lock();

        let start = match usize::try_from(from_offset) {
            Ok(start) if start < state.events.len() => start,
            _ => return Ok(Vec::new()),
        };
        Ok(state.events[start..].iter().take(limit).cloned().collect())
    }

    async fn head(&self, stream_id: &StreamId) -> Result<StreamHead, LogError> {
        let stream = self.stream(stream_id)?;
        let state = stream.lock();
        Ok(StreamHead {
            next_offset: state.events.len() as Offset,
            closed: state.closed,
        })
    }

    async fn close_stream(&self, stream_id: &StreamId) -> Result<(), LogError> {
        let stream = self.stream(stream_id)?;
        let mut state = stream.lock();
        if !state.closed {
            state.closed = true;
            debug!(%stream_id, "closed stream");
        }
        Ok(())
    }
}
