//! Per-subscriber replay-then-live cursor

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use agentdeck_core::{Event, Offset, StreamId};

use super::{BrokerError, BrokerInner};

/// Cloneable handle that cancels one subscription
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

enum Wake {
    Cancelled,
    Shutdown,
    Signalled,
    Poll,
}

/// Releases the broker's per-stream slot when the subscription goes away
struct Registration {
    broker: Arc<BrokerInner>,
    stream_id: StreamId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.broker.release(&self.stream_id);
    }
}

/// A single consumer's view of one stream.
///
/// Yields every event with `offset >= from_offset` that was durable at
/// subscribe time, then every newly appended event. `None` means the
/// subscription ended cleanly (cancelled, or the stream was closed and
/// fully drained).
pub struct Subscription {
    stream_id: StreamId,
    cursor: Offset,
    buffer: VecDeque<Event>,
    wakeup: watch::Receiver<u64>,
    cancel: CancellationToken,
    done: bool,
    registration: Registration,
}

impl Subscription {
    pub(super) fn new(
        broker: Arc<BrokerInner>,
        stream_id: StreamId,
        from_offset: Offset,
        wakeup: watch::Receiver<u64>,
    ) -> Self {
        Self {
            stream_id: stream_id.clone(),
            cursor: from_offset,
            buffer: VecDeque::new(),
            wakeup,
            cancel: CancellationToken::new(),
            done: false,
            registration: Registration { broker, stream_id },
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Offset of the next event this subscription will yield. Persist it to
    /// resume after a reconnect.
    pub fn cursor(&self) -> Offset {
        self.cursor
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Next event, `None` on clean end, `Some(Err(..))` on failure.
    ///
    /// A log read failure is returned without ending the subscription;
    /// calling `next` again retries from the same cursor.
    pub async fn next(&mut self) -> Option<Result<Event, BrokerError>> {
        let broker = self.registration.broker.clone();
        let batch_size = broker.config.batch_size;
        let poll_interval = broker.config.poll_interval;

        loop {
            if self.done {
                return None;
            }

            if self.cancel.is_cancelled() {
                return self.end(None);
            }
            if broker.shutdown.is_cancelled() {
                return self.end(Some(Err(BrokerError::Shutdown)));
            }

            if let Some(event) = self.buffer.pop_front() {
                self.cursor = event.offset + 1;
                return Some(Ok(event));
            }

            // Arm before reading so an append racing with the read is seen
            self.wakeup.borrow_and_update();

            let batch = match broker.log.read(&self.stream_id, self.cursor, batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        stream_id = %self.stream_id,
                        cursor = self.cursor,
                        error = %e,
                        "Failed to read stream"
                    );
                    return Some(Err(e.into()));
                }
            };
            if !batch.is_empty() {
                trace!(
                    stream_id = %self.stream_id,
                    cursor = self.cursor,
                    count = batch.len(),
                    "Fetched batch"
                );
                self.buffer.extend(batch);
                continue;
            }

            let head = match broker.log.head(&self.stream_id).await {
                Ok(head) => head,
                Err(e) => return Some(Err(e.into())),
            };
            if head.closed && self.cursor >= head.next_offset {
                trace!(
                    stream_id = %self.stream_id,
                    cursor = self.cursor,
                    "Stream closed and drained"
                );
                return self.end(None);
            }

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = broker.shutdown.cancelled() => Wake::Shutdown,
                changed = self.wakeup.changed() => match changed {
                    Ok(()) => Wake::Signalled,
                    // Signal dropped: the broker released this stream
                    Err(_) => Wake::Shutdown,
                },
                _ = tokio::time::sleep(poll_interval) => Wake::Poll,
            };
            match wake {
                Wake::Cancelled => return self.end(None),
                Wake::Shutdown => return self.end(Some(Err(BrokerError::Shutdown))),
                Wake::Signalled | Wake::Poll => {}
            }
        }
    }

    fn end(
        &mut self,
        result: Option<Result<Event, BrokerError>>,
    ) -> Option<Result<Event, BrokerError>> {
        self.done = true;
        result
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<Event, BrokerError>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|item| (item, subscription))
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream_id", &self.stream_id)
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffer.len())
            .field("done", &self.done)
            .finish()
    }
}
