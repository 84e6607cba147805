//! EventLog trait definition

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use agentdeck_core::{Channel, Event, Offset, StreamId};

/// Error type for event log operations
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Stream does not exist
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Stream was already created
    #[error("stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    /// Stream is closed to further appends
    #[error("stream closed: {0}")]
    StreamClosed(StreamId),

    /// Channel is not part of the stream's schema
    #[error("channel {channel} not allowed on stream {stream_id}")]
    ChannelNotAllowed { stream_id: StreamId, channel: Channel },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Set of channels a stream accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSchema {
    /// Every known channel
    #[default]
    All,
    /// Only the listed channels
    Channels(BTreeSet<Channel>),
}

impl StreamSchema {
    pub fn channels<I: IntoIterator<Item = Channel>>(channels: I) -> Self {
        StreamSchema::Channels(channels.into_iter().collect())
    }

    /// `Unknown` is never accepted for append
    pub fn allows(&self, channel: Channel) -> bool {
        match self {
            _ if channel == Channel::Unknown => false,
            StreamSchema::All => true,
            StreamSchema::Channels(channels) => channels.contains(&channel),
        }
    }
}

/// Tail of a stream, used to reconcile replay with live delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    /// Offset the next append will receive
    pub next_offset: Offset,
    pub closed: bool,
}

/// Append-only, per-stream event storage.
///
/// Appends to one stream are serialized and assign `offset = next_offset`;
/// appends to different streams are independent. An event is durable when
/// `append` returns.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Create an empty stream
    async fn create_stream(&self, stream_id: &StreamId, schema: StreamSchema)
        -> Result<(), LogError>;

    /// Append one event and return it with its assigned offset
    async fn append(
        &self,
        stream_id: &StreamId,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Result<Event, LogError>;

    /// Events with `offset >= from_offset`, at most `limit`, in offset order
    async fn read(
        &self,
        stream_id: &StreamId,
        from_offset: Offset,
        limit: usize,
    ) -> Result<Vec<Event>, LogError>;

    async fn head(&self, stream_id: &StreamId) -> Result<StreamHead, LogError>;

    /// Mark the stream closed. Closing twice is a no-op.
    async fn close_stream(&self, stream_id: &StreamId) -> Result<(), LogError>;
}
