// Session service
//
// One lifecycle context per session, serialized by an async mutex. Accepted
// transitions are appended to the session stream on the `status` channel
// before the in-memory context is replaced, so the log is never behind.
// Contexts not in memory (e.g. after a restart) are rebuilt from the last
// `status` event of the stream. Closing a session also releases its agents
// from the AgentService, when one is attached.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use agentdeck_core::{
    send_session_event, EventPayload, SessionEvent, SessionLifecycleContext, SessionStatus,
    SessionStatusData, StreamId,
};
use agentdeck_durable::{StreamBroker, StreamSchema};

use super::{now_millis, replay_latest, AgentService, ServiceError};

type SessionEntry = Arc<Mutex<SessionLifecycleContext>>;

pub struct SessionService {
    broker: StreamBroker,
    sessions: DashMap<String, SessionEntry>,
    agents: Option<Arc<AgentService>>,
}

impl SessionService {
    pub fn new(broker: StreamBroker) -> Self {
        Self {
            broker,
            sessions: DashMap::new(),
            agents: None,
        }
    }

    /// Release a session's agents from `agents` when it closes
    pub fn with_agents(mut self, agents: Arc<AgentService>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Create the session stream and record the initial idle context
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn create(
        &self,
        session_id: &str,
        max_participants: u32,
        idle_timeout_ms: Option<i64>,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        let stream_id = StreamId::new(session_id);
        self.broker
            .create_stream(&stream_id, StreamSchema::All)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;

        let mut context = SessionLifecycleContext::new(max_participants, now_millis());
        if let Some(timeout) = idle_timeout_ms {
            context = context.with_idle_timeout_ms(timeout);
        }
        self.record(session_id, &context).await?;
        self.sessions
            .insert(session_id.to_string(), Arc::new(Mutex::new(context.clone())));

        info!(max_participants, "session created");
        Ok(context)
    }

    /// Current context of a session
    pub async fn get(&self, session_id: &str) -> Result<SessionLifecycleContext, ServiceError> {
        let entry = self.entry(session_id).await?;
        let context = entry.lock().await;
        Ok(context.clone())
    }

    /// Run one event through the session machine and persist the result
    #[instrument(skip_all, fields(session_id = %session_id, event = event.name()))]
    pub async fn send(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        let entry = self.entry(session_id).await?;
        let mut current = entry.lock().await;

        let next = match send_session_event(&current, &event) {
            Ok(next) => next,
            Err(rejection) => {
                debug!(code = %rejection.code, "session event rejected");
                return Err(rejection.into());
            }
        };

        self.record(session_id, &next).await?;
        *current = next.clone();

        if next.status == SessionStatus::Closed {
            self.broker
                .close_stream(&StreamId::new(session_id))
                .await
                .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;
            self.sessions.remove(session_id);
            if let Some(agents) = &self.agents {
                agents.release_session(session_id);
            }
            info!("session closed");
        }

        Ok(next)
    }

    /// INITIALIZE then READY
    pub async fn activate(
        &self,
        session_id: &str,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        let at = now_millis();
        self.send(session_id, SessionEvent::Initialize { at }).await?;
        self.send(session_id, SessionEvent::Ready { at }).await
    }

    pub async fn join(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        self.send(session_id, SessionEvent::join(user_id, now_millis()))
            .await
    }

    pub async fn leave(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        self.send(session_id, SessionEvent::leave(user_id, now_millis()))
            .await
    }

    pub async fn heartbeat(
        &self,
        session_id: &str,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        self.send(session_id, SessionEvent::Heartbeat { at: now_millis() })
            .await
    }

    /// Drive the session to `closed`, passing through `closing` when needed
    pub async fn close(
        &self,
        session_id: &str,
    ) -> Result<SessionLifecycleContext, ServiceError> {
        let context = self.send(session_id, SessionEvent::Close).await?;
        if context.status == SessionStatus::Closed {
            return Ok(context);
        }
        self.send(session_id, SessionEvent::Close).await
    }

    /// Offer TIMEOUT to every stale session in memory and close the ones
    /// that accept it. Returns the number of sessions closed.
    pub async fn reap_idle(&self, now: i64) -> usize {
        let candidates: Vec<(String, SessionEntry)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut closed = 0;
        for (session_id, entry) in candidates {
            let stale = {
                let context = entry.lock().await;
                context.status == SessionStatus::Active && context.is_stale(now)
            };
            if !stale {
                continue;
            }

            match self.send(&session_id, SessionEvent::Timeout { now }).await {
                Ok(_) => match self.close(&session_id).await {
                    Ok(_) => closed += 1,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "failed to close idle session")
                    }
                },
                // Activity raced in between the check and the send
                Err(ServiceError::Rejected { .. }) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to time out session")
                }
            }
        }

        if closed > 0 {
            info!(closed, "closed idle sessions");
        }
        closed
    }

    /// Periodically reap idle sessions until cancelled
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        service.reap_idle(now_millis()).await;
                    }
                }
            }
            debug!("session reaper stopped");
        })
    }

    /// Sessions currently held in memory
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // ============================================
    // Internals
    // ============================================

    async fn record(
        &self,
        session_id: &str,
        context: &SessionLifecycleContext,
    ) -> Result<(), ServiceError> {
        let data = SessionStatusData {
            session_id: session_id.to_string(),
            context: context.clone(),
        };
        self.broker
            .publish(&StreamId::new(session_id), data)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;
        Ok(())
    }

    async fn entry(&self, session_id: &str) -> Result<SessionEntry, ServiceError> {
        if let Some(entry) = self.sessions.get(session_id) {
            return Ok(entry.value().clone());
        }

        let context = self.load(session_id).await?;
        if context.status == SessionStatus::Closed {
            return Ok(Arc::new(Mutex::new(context)));
        }
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(context)));
        Ok(entry.value().clone())
    }

    /// Rebuild a context from the last `status` event on the stream
    async fn load(&self, session_id: &str) -> Result<SessionLifecycleContext, ServiceError> {
        let latest = replay_latest(&self.broker, &StreamId::new(session_id), |payload| {
            match payload {
                EventPayload::Status(data) if data.session_id == session_id => Some(data.context),
                _ => None,
            }
        })
        .await
        .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;

        let context =
            latest.ok_or_else(|| ServiceError::NotFound(format!("session {}", session_id)))?;
        debug!(session_id, status = %context.status, "session context restored from log");
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdeck_core::{Channel, RejectionCode};
    use agentdeck_durable::{BrokerConfig, InMemoryEventLog};

    fn service() -> (SessionService, StreamBroker) {
        let broker = StreamBroker::new(Arc::new(InMemoryEventLog::new()), BrokerConfig::default());
        (SessionService::new(broker.clone()), broker)
    }

    #[tokio::test]
    async fn test_create_records_idle_status() {
        let (service, broker) = service();
        let context = service.create("s1", 2, None).await.unwrap();
        assert_eq!(context.status, SessionStatus::Idle);

        let events = broker.read(&StreamId::new("s1"), 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, Channel::Status);
        assert_eq!(events[0].payload["context"]["status"], "idle");
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let (service, _) = service();
        service.create("s1", 2, None).await.unwrap();
        let err = service.create("s1", 2, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_not_recorded() {
        let (service, broker) = service();
        service.create("s1", 2, None).await.unwrap();
        service.activate("s1").await.unwrap();
        service.join("s1", "u1").await.unwrap();
        service.join("s1", "u2").await.unwrap();
        let before = broker.head(&StreamId::new("s1")).await.unwrap().next_offset;

        let err = service.join("s1", "u3").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Rejected {
                code: RejectionCode::SessionCapacityReached,
                ..
            }
        ));

        let after = broker.head(&StreamId::new("s1")).await.unwrap().next_offset;
        assert_eq!(before, after);
        assert_eq!(service.get("s1").await.unwrap().participants, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_further_events_rejected() {
        let (service, broker) = service();
        service.create("s1", 2, None).await.unwrap();
        service.activate("s1").await.unwrap();

        let closed = service.close("s1").await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(broker.head(&StreamId::new("s1")).await.unwrap().closed);
        assert!(service.is_empty());

        // Restored from the log, still closed
        let err = service.join("s1", "u1").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Rejected {
                code: RejectionCode::SessionClosed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_releases_session_agents() {
        let (service, broker) = service();
        let agents = Arc::new(AgentService::new(broker.clone()));
        let service = service.with_agents(agents.clone());
        service.create("s1", 2, None).await.unwrap();
        service.create("s2", 2, None).await.unwrap();
        service.activate("s1").await.unwrap();

        let tools: std::collections::BTreeSet<String> = ["bash".to_string()].into();
        agents.register("s1", "a1", 5, tools.clone()).await.unwrap();
        agents.register("s2", "a1", 5, tools).await.unwrap();
        assert_eq!(agents.len(), 2);

        service.close("s1").await.unwrap();
        assert_eq!(agents.len(), 1);
    }

    #[tokio::test]
    async fn test_context_restored_after_restart() {
        let (service, broker) = service();
        service.create("s1", 3, None).await.unwrap();
        service.activate("s1").await.unwrap();
        service.join("s1", "u1").await.unwrap();

        let restarted = SessionService::new(broker);
        let context = restarted.get("s1").await.unwrap();
        assert_eq!(context.status, SessionStatus::Active);
        assert_eq!(context.participants, vec!["u1"]);
        assert_eq!(context.max_participants, 3);
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let (service, _) = service();
        let err = service.join("missing", "u1").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reap_idle_closes_only_stale_sessions() {
        let (service, _) = service();
        service.create("stale", 2, Some(1_000)).await.unwrap();
        service.activate("stale").await.unwrap();
        service.create("fresh", 2, Some(60_000)).await.unwrap();
        service.activate("fresh").await.unwrap();

        let closed = service.reap_idle(now_millis() + 5_000).await;
        assert_eq!(closed, 1);

        let err = service.heartbeat("stale").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Rejected {
                code: RejectionCode::SessionClosed,
                ..
            }
        ));
        assert_eq!(
            service.get("fresh").await.unwrap().status,
            SessionStatus::Active
        );
    }
}
