// View service
//
// Materialized per-session views. Each session gets one SessionProjection
// behind its own RwLock, fed by a background subscription that starts at
// offset 0 the first time the session is queried. Reads are eventually
// consistent; `sync` waits briefly for the view to reach the stream head
// observed at request time. A view leaves the cache once its feed ends
// (session closed and drained, detach or shutdown); a later query on a
// closed session rebuilds it from the log.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use agentdeck_core::{
    AgentStateView, ApplyOutcome, Event, MessageView, Offset, PresenceView, SessionProjection,
    SessionStateView, StreamId, TerminalLine, ToolCallView, WorkflowStepView,
};
use agentdeck_durable::{BrokerError, CancelHandle, StreamBroker, Subscription};

use super::ServiceError;

/// How long a query waits for its view to catch up
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause before retrying after a failed log read
const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    applied: Option<Offset>,
    ended: bool,
}

/// One session's projection and the handle of the task feeding it
pub struct SessionView {
    stream_id: StreamId,
    projection: RwLock<SessionProjection>,
    progress: watch::Sender<Progress>,
    cancel: CancelHandle,
}

impl SessionView {
    fn new(stream_id: StreamId, cancel: CancelHandle) -> Self {
        Self {
            stream_id,
            projection: RwLock::new(SessionProjection::new()),
            progress: watch::channel(Progress::default()).0,
            cancel,
        }
    }

    fn apply(&self, event: &Event) -> ApplyOutcome {
        let (outcome, applied) = {
            let mut projection = self.projection.write();
            let outcome = projection.apply(event);
            (outcome, projection.last_applied(&self.stream_id))
        };
        self.progress.send_modify(|progress| progress.applied = applied);
        outcome
    }

    fn mark_ended(&self) {
        self.progress.send_modify(|progress| progress.ended = true);
    }

    /// Read the projection under the lock
    pub fn read<R>(&self, f: impl FnOnce(&SessionProjection) -> R) -> R {
        f(&*self.projection.read())
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Highest offset applied so far
    pub fn applied_offset(&self) -> Option<Offset> {
        self.progress.borrow().applied
    }

    /// Whether the feeding subscription has ended
    pub fn is_ended(&self) -> bool {
        self.progress.borrow().ended
    }

    /// Wait until `offset` has been applied or the feed ended. Returns
    /// whether the offset was reached within `timeout`.
    pub async fn wait_for(&self, offset: Offset, timeout: Duration) -> bool {
        let mut rx = self.progress.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|p| p.ended || p.applied.is_some_and(|a| a >= offset)),
        )
        .await
        .is_ok();
        settled && self.applied_offset().is_some_and(|a| a >= offset)
    }
}

type Views = Arc<DashMap<String, Arc<SessionView>>>;

pub struct ViewService {
    broker: StreamBroker,
    views: Views,
    sync_timeout: Duration,
}

impl ViewService {
    pub fn new(broker: StreamBroker) -> Self {
        Self {
            broker,
            views: Arc::new(DashMap::new()),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Get the session's view, starting its feed on first use
    pub async fn attach(&self, session_id: &str) -> Result<Arc<SessionView>, ServiceError> {
        if let Some(view) = self.views.get(session_id) {
            return Ok(view.value().clone());
        }

        let stream_id = StreamId::new(session_id);
        let subscription = self
            .broker
            .subscribe(&stream_id, 0)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;

        let view = match self.views.entry(session_id.to_string()) {
            // Lost a race with another attach; dropping ours releases the slot
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let view = Arc::new(SessionView::new(stream_id, subscription.cancel_handle()));
                slot.insert(view.clone());
                view
            }
        };

        tokio::spawn(feed(
            view.clone(),
            subscription,
            self.views.clone(),
            session_id.to_string(),
        ));
        info!(session_id, "attached session view");
        Ok(view)
    }

    /// Attach, then wait up to the sync timeout for the view to reach the
    /// current head of the stream
    pub async fn sync(&self, session_id: &str) -> Result<Arc<SessionView>, ServiceError> {
        let view = self.attach(session_id).await?;
        let head = self
            .broker
            .head(view.stream_id())
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;

        if let Some(last) = head.next_offset.checked_sub(1) {
            if !view.wait_for(last, self.sync_timeout).await {
                debug!(
                    session_id,
                    target = last,
                    applied = ?view.applied_offset(),
                    "view still catching up"
                );
            }
        }
        Ok(view)
    }

    /// Stop feeding a session's view and forget it
    pub fn detach(&self, session_id: &str) -> bool {
        match self.views.remove(session_id) {
            Some((_, view)) => {
                view.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop all feeds
    pub fn shutdown(&self) {
        for view in self.views.iter() {
            view.cancel.cancel();
        }
        self.views.clear();
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    // ============================================
    // Queries
    // ============================================

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.messages(view.stream_id())))
    }

    pub async fn get_tool_calls(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolCallView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.tool_calls(view.stream_id())))
    }

    pub async fn get_presence(&self, session_id: &str) -> Result<Vec<PresenceView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.presence(view.stream_id())))
    }

    pub async fn get_terminal(&self, session_id: &str) -> Result<Vec<TerminalLine>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.terminal(view.stream_id())))
    }

    pub async fn get_workflow_steps(
        &self,
        session_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowStepView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.workflow_steps(workflow_id)))
    }

    pub async fn get_agent_state(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<AgentStateView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.agent_state(agent_id).cloned()))
    }

    pub async fn get_agent_states(
        &self,
        session_id: &str,
    ) -> Result<Vec<AgentStateView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.agent_states(view.stream_id())))
    }

    pub async fn get_session_state(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionStateView>, ServiceError> {
        let view = self.sync(session_id).await?;
        Ok(view.read(|p| p.session_state(session_id).cloned()))
    }
}

/// Fold the subscription into the view until it ends, then drop the view
/// from the cache. Readers already holding it keep the final state.
async fn feed(
    view: Arc<SessionView>,
    mut subscription: Subscription,
    views: Views,
    session_id: String,
) {
    while let Some(next) = subscription.next().await {
        match next {
            Ok(event) => {
                if let ApplyOutcome::Skipped = view.apply(&event) {
                    debug!(
                        stream_id = %view.stream_id,
                        offset = event.offset,
                        "event skipped by projection"
                    );
                }
            }
            Err(BrokerError::Shutdown) => break,
            Err(e) => {
                warn!(
                    stream_id = %view.stream_id,
                    cursor = subscription.cursor(),
                    error = %e,
                    "view feed read failed, retrying"
                );
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
    view.mark_ended();
    // Only our own entry; a newer attach may have replaced it
    views.remove_if(&session_id, |_, cached| Arc::ptr_eq(cached, &view));
    debug!(
        stream_id = %view.stream_id,
        applied = ?view.applied_offset(),
        cached = views.len(),
        "view feed ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdeck_core::{ChunkData, PresenceData, ToolCallData};
    use agentdeck_durable::{BrokerConfig, InMemoryEventLog, StreamSchema};
    use serde_json::json;

    async fn setup() -> (ViewService, StreamBroker) {
        let broker = StreamBroker::new(Arc::new(InMemoryEventLog::new()), BrokerConfig::default());
        broker
            .create_stream(&StreamId::new("s1"), StreamSchema::All)
            .await
            .unwrap();
        (
            ViewService::new(broker.clone()).with_sync_timeout(Duration::from_secs(2)),
            broker,
        )
    }

    #[tokio::test]
    async fn test_messages_assembled_from_chunks() {
        let (views, broker) = setup().await;
        let id = StreamId::new("s1");
        for text in ["He", "llo", " world"] {
            broker.publish(&id, ChunkData::new("a1", 0, text)).await.unwrap();
        }

        let messages = views.get_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hello world");
    }

    #[tokio::test]
    async fn test_view_follows_live_appends() {
        let (views, broker) = setup().await;
        let id = StreamId::new("s1");
        assert!(views.get_tool_calls("s1").await.unwrap().is_empty());

        broker
            .publish(&id, ToolCallData::started("c1", "bash", json!({"cmd": "ls"})))
            .await
            .unwrap();
        broker
            .publish(&id, PresenceData {
                user_id: "u1".into(),
                last_seen: 5,
                cursor: None,
            })
            .await
            .unwrap();

        let calls = views.get_tool_calls("s1").await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(views.get_presence("s1").await.unwrap().len(), 1);
        assert_eq!(views.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let (views, _) = setup().await;
        let err = views.get_messages("nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(views.is_empty());
    }

    #[tokio::test]
    async fn test_detach_releases_subscription() {
        let (views, broker) = setup().await;
        let id = StreamId::new("s1");
        views.attach("s1").await.unwrap();
        assert_eq!(broker.subscriber_count(&id), 1);

        assert!(views.detach("s1"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.subscriber_count(&id) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_view_stays_readable() {
        let (views, broker) = setup().await;
        let id = StreamId::new("s1");
        broker.publish(&id, ChunkData::new("a1", 0, "bye")).await.unwrap();
        broker.close_stream(&id).await.unwrap();

        let view = views.sync("s1").await.unwrap();
        assert_eq!(view.applied_offset(), Some(0));
        let messages = views.get_messages("s1").await.unwrap();
        assert_eq!(messages[0].text, "bye");
    }

    #[tokio::test]
    async fn test_closed_sessions_leave_the_cache() {
        let (views, broker) = setup().await;
        let ids: Vec<StreamId> = (0..5).map(|i| StreamId::new(format!("c{}", i))).collect();
        for id in &ids {
            broker.create_stream(id, StreamSchema::All).await.unwrap();
            broker.publish(id, ChunkData::new("a1", 0, "hi")).await.unwrap();
            views.get_messages(id.as_str()).await.unwrap();
        }
        views.get_messages("s1").await.unwrap();
        assert_eq!(views.len(), 6);

        for id in &ids {
            broker.close_stream(id).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while views.len() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        // The open session keeps its view
        assert_eq!(views.len(), 1);

        // Querying a closed session again still answers, then lets go
        let messages = views.get_messages("c0").await.unwrap();
        assert_eq!(messages[0].text, "hi");
        tokio::time::timeout(Duration::from_secs(2), async {
            while views.len() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.subscriber_count(&ids[0]), 0);
    }
}
