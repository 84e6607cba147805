//! In-memory replay buffer for one ephemeral job

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use agentdeck_core::Offset;

use super::JobError;

struct JobState<T> {
    items: Vec<T>,
    finished: bool,
}

/// Progress history of one background job.
///
/// Same replay-then-live contract as a durable stream, but nothing outlives
/// the buffer: once every holder drops it the history is gone.
pub struct JobBuffer<T> {
    job_id: String,
    state: Mutex<JobState<T>>,
    wakeup: watch::Sender<u64>,
}

impl<T: Clone + Send + Sync + 'static> JobBuffer<T> {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: Mutex::new(JobState {
                items: Vec::new(),
                finished: false,
            }),
            wakeup: watch::channel(0).0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Append an item and wake subscribers
    pub fn publish(&self, item: T) -> Result<Offset, JobError> {
        let offset = {
            let mut state = self.state.lock();
            if state.finished {
                return Err(JobError::JobFinished(self.job_id.clone()));
            }
            state.items.push(item);
            (state.items.len() - 1) as Offset
        };
        self.signal();
        Ok(offset)
    }

    /// Mark the job complete. Subscribers drain what is left and end.
    pub fn finish(&self) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        self.signal();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay from `from_offset`, then follow live items
    pub fn subscribe(self: &Arc<Self>, from_offset: Offset) -> JobSubscription<T> {
        JobSubscription {
            buffer: self.clone(),
            cursor: from_offset,
            wakeup: self.wakeup.subscribe(),
            cancel: CancellationToken::new(),
            done: false,
        }
    }

    fn signal(&self) {
        self.wakeup
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl<T> std::fmt::Debug for JobBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobBuffer")
            .field("job_id", &self.job_id)
            .field("items", &state.items.len())
            .field("finished", &state.finished)
            .finish()
    }
}

/// One item delivered to a job subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct JobItem<T> {
    pub offset: Offset,
    pub item: T,
}

enum Step<T> {
    Item(JobItem<T>),
    Finished,
    Wait,
}

/// Subscriber cursor over a [`JobBuffer`]
pub struct JobSubscription<T> {
    buffer: Arc<JobBuffer<T>>,
    cursor: Offset,
    wakeup: watch::Receiver<u64>,
    cancel: CancellationToken,
    done: bool,
}

impl<T: Clone + Send + Sync + 'static> JobSubscription<T> {
    pub fn job_id(&self) -> &str {
        self.buffer.job_id()
    }

    pub fn cursor(&self) -> Offset {
        self.cursor
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next item; `None` once the job finished and everything was delivered,
    /// or on cancel.
    pub async fn next(&mut self) -> Option<JobItem<T>> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            match self.arm_and_poll() {
                Step::Item(item) => {
                    self.cursor = item.offset + 1;
                    return Some(item);
                }
                Step::Finished => {
                    self.done = true;
                    return None;
                }
                Step::Wait => {}
            }

            if !self.wait().await {
                self.done = true;
                return None;
            }
        }
    }

    /// Arm the wakeup token, then inspect the buffer. Anything published
    /// after this returns `Wait` makes the following `wait` return at once.
    fn arm_and_poll(&mut self) -> Step<T> {
        self.wakeup.borrow_and_update();
        self.poll_buffer()
    }

    /// Block until signalled; `false` on cancel or a dropped buffer
    async fn wait(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            changed = self.wakeup.changed() => changed.is_ok(),
        }
    }

    fn poll_buffer(&self) -> Step<T> {
        let state = self.buffer.state.lock();
        let item = usize::try_from(self.cursor)
            .ok()
            .and_then(|index| state.items.get(index));
        match item {
            Some(item) => Step::Item(JobItem {
                offset: self.cursor,
                item: item.clone(),
            }),
            None if state.finished => Step::Finished,
            None => Step::Wait,
        }
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = JobItem<T>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|item| (item, subscription))
        })
    }
}
