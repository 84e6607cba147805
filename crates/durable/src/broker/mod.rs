//! Subscriber broker
//!
//! Fans a stream's events out to any number of subscribers, each with its own
//! cursor. The broker is also the write front: appends go through it so every
//! waiting subscriber of that stream is woken.
//!
//! ```text
//!   service ──append──► StreamBroker ──► EventLog (durable, assigns offset)
//!                            │
//!                            └─ watch::Sender<u64> per stream (wakeup only)
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!            ▼                      ▼                      ▼
//!      Subscription           Subscription           Subscription
//!   (cursor, batch buf)    (cursor, batch buf)    (cursor, batch buf)
//!            │  read(cursor, batch_size) from the log on every wakeup
//! ```
//!
//! The signal carries no data. Subscribers always read from the log, so a
//! slow subscriber only delays itself and writers never wait on readers.

mod config;
mod subscription;

pub use config::BrokerConfig;
pub use subscription::{CancelHandle, Subscription};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use agentdeck_core::{Channel, Event, EventPayload, Offset, StreamId};

use crate::persistence::{EventLog, LogError, StreamHead, StreamSchema};

/// Errors returned by the broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Log(#[from] LogError),

    /// Stream already has the maximum number of subscribers
    #[error("subscriber limit reached for stream {stream_id} (max {limit})")]
    SubscriberLimit { stream_id: StreamId, limit: usize },

    /// Broker was shut down
    #[error("broker shut down")]
    Shutdown,

    /// Payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

struct StreamSignal {
    sender: watch::Sender<u64>,
    subscribers: usize,
}

pub(crate) struct BrokerInner {
    log: Arc<dyn EventLog>,
    config: BrokerConfig,
    signals: DashMap<StreamId, StreamSignal>,
    shutdown: CancellationToken,
}

impl BrokerInner {
    fn notify(&self, stream_id: &StreamId) {
        if let Some(signal) = self.signals.get(stream_id) {
            signal.sender.send_modify(|generation| *generation = generation.wrapping_add(1));
        }
    }

    /// Drop one subscriber; the signal goes away with the last one
    fn release(&self, stream_id: &StreamId) {
        if let Some(mut signal) = self.signals.get_mut(stream_id) {
            signal.subscribers = signal.subscribers.saturating_sub(1);
        }
        if self
            .signals
            .remove_if(stream_id, |_, signal| signal.subscribers == 0)
            .is_some()
        {
            debug!(%stream_id, "released stream signal");
        }
    }
}

/// Write front and subscription hub for event streams
#[derive(Clone)]
pub struct StreamBroker {
    inner: Arc<BrokerInner>,
}

impl StreamBroker {
    pub fn new(log: Arc<dyn EventLog>, config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                log,
                config,
                signals: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.inner.log
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        Ok(())
    }

    pub async fn create_stream(
        &self,
        stream_id: &StreamId,
        schema: StreamSchema,
    ) -> Result<(), BrokerError> {
        self.ensure_running()?;
        self.inner.log.create_stream(stream_id, schema).await?;
        Ok(())
    }

    /// Append to the log, then wake the stream's subscribers
    #[instrument(skip_all, fields(stream_id = %stream_id, channel = %channel))]
    pub async fn append(
        &self,
        stream_id: &StreamId,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Result<Event, BrokerError> {
        self.ensure_running()?;
        let event = self.inner.log.append(stream_id, channel, payload).await?;
        self.inner.notify(stream_id);
        Ok(event)
    }

    /// Append a typed payload
    pub async fn publish(
        &self,
        stream_id: &StreamId,
        payload: impl Into<EventPayload>,
    ) -> Result<Event, BrokerError> {
        let payload: EventPayload = payload.into();
        let (channel, value) = payload
            .into_parts()
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.append(stream_id, channel, value).await
    }

    /// Close the stream; subscribers end once they have drained it
    pub async fn close_stream(&self, stream_id: &StreamId) -> Result<(), BrokerError> {
        self.inner.log.close_stream(stream_id).await?;
        self.inner.notify(stream_id);
        Ok(())
    }

    pub async fn read(
        &self,
        stream_id: &StreamId,
        from_offset: Offset,
        limit: usize,
    ) -> Result<Vec<Event>, BrokerError> {
        Ok(self.inner.log.read(stream_id, from_offset, limit).await?)
    }

    pub async fn head(&self, stream_id: &StreamId) -> Result<StreamHead, BrokerError> {
        Ok(self.inner.log.head(stream_id).await?)
    }

    /// Subscribe from `from_offset`. Fails if the stream does not exist or
    /// already has `max_subscribers_per_stream` subscribers.
    #[instrument(skip_all, fields(stream_id = %stream_id, from_offset = from_offset))]
    pub async fn subscribe(
        &self,
        stream_id: &StreamId,
        from_offset: Offset,
    ) -> Result<Subscription, BrokerError> {
        self.ensure_running()?;
        self.inner.log.head(stream_id).await?;

        let limit = self.inner.config.max_subscribers_per_stream;
        let wakeup = {
            let mut signal = self
                .inner
                .signals
                .entry(stream_id.clone())
                .or_insert_with(|| StreamSignal {
                    sender: watch::channel(0).0,
                    subscribers: 0,
                });
            if signal.subscribers >= limit {
                // A fresh entry at limit 0 would otherwise leak
                drop(signal);
                self.inner
                    .signals
                    .remove_if(stream_id, |_, signal| signal.subscribers == 0);
                return Err(BrokerError::SubscriberLimit {
                    stream_id: stream_id.clone(),
                    limit,
                });
            }
            signal.subscribers += 1;
            signal.sender.subscribe()
        };

        debug!(from_offset, "subscriber attached");
        Ok(Subscription::new(
            self.inner.clone(),
            stream_id.clone(),
            from_offset,
            wakeup,
        ))
    }

    /// Live subscribers on a stream
    pub fn subscriber_count(&self, stream_id: &StreamId) -> usize {
        self.inner
            .signals
            .get(stream_id)
            .map(|signal| signal.subscribers)
            .unwrap_or(0)
    }

    /// Streams with at least one subscriber
    pub fn active_streams(&self) -> usize {
        self.inner.signals.len()
    }

    /// Tear the broker down. Live subscribers observe `BrokerError::Shutdown`
    /// and further writes are refused.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!(active_streams = self.inner.signals.len(), "shutting down stream broker");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
