// Agent service
//
// Agents live inside a session: their lifecycle contexts are recorded on the
// session stream's `agent_state` channel. A STEP past the turn budget is
// rejected and additionally recorded as an agent ERROR so the run ends.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use agentdeck_core::{
    send_agent_event, AgentEvent, AgentLifecycleContext, AgentStateData, Event, EventPayload,
    RejectionCode, StreamId,
};
use agentdeck_durable::StreamBroker;

use super::{replay_latest, ServiceError};

type AgentKey = (String, String);
type AgentEntry = Arc<Mutex<AgentLifecycleContext>>;

/// Holds an agent key while its registration is in flight
struct Reservation<'a> {
    registering: &'a DashSet<AgentKey>,
    key: AgentKey,
}

impl<'a> Reservation<'a> {
    fn acquire(registering: &'a DashSet<AgentKey>, key: AgentKey) -> Option<Self> {
        registering.insert(key.clone()).then(|| Self { registering, key })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registering.remove(&self.key);
    }
}

pub struct AgentService {
    broker: StreamBroker,
    agents: DashMap<AgentKey, AgentEntry>,
    registering: DashSet<AgentKey>,
}

impl AgentService {
    pub fn new(broker: StreamBroker) -> Self {
        Self {
            broker,
            agents: DashMap::new(),
            registering: DashSet::new(),
        }
    }

    /// Register an idle agent on an existing session
    #[instrument(skip_all, fields(session_id = %session_id, agent_id = %agent_id))]
    pub async fn register(
        &self,
        session_id: &str,
        agent_id: &str,
        max_turns: u32,
        allowed_tools: BTreeSet<String>,
    ) -> Result<AgentLifecycleContext, ServiceError> {
        let exists = || ServiceError::AlreadyExists(format!("agent {}", agent_id));
        let key = (session_id.to_string(), agent_id.to_string());
        if self.agents.contains_key(&key) {
            return Err(exists());
        }
        // Held across the log check and the append below
        let _reservation = Reservation::acquire(&self.registering, key.clone()).ok_or_else(exists)?;
        if self.load(session_id, agent_id).await.is_ok() {
            return Err(exists());
        }

        let context = AgentLifecycleContext::new(max_turns, allowed_tools);
        self.record(session_id, agent_id, &context).await?;
        // A concurrent lookup may already have loaded the recorded state
        self.agents
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(context.clone())));

        info!(max_turns, "agent registered");
        Ok(context)
    }

    pub async fn get(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<AgentLifecycleContext, ServiceError> {
        let entry = self.entry(session_id, agent_id).await?;
        let context = entry.lock().await;
        Ok(context.clone())
    }

    /// Run one event through the agent machine and persist the result.
    ///
    /// A STEP rejected for the turn budget is returned as a rejection, but the
    /// agent is moved to `error` with that code first.
    #[instrument(
        skip_all,
        fields(session_id = %session_id, agent_id = %agent_id, event = event.name())
    )]
    pub async fn send(
        &self,
        session_id: &str,
        agent_id: &str,
        event: AgentEvent,
    ) -> Result<AgentLifecycleContext, ServiceError> {
        let entry = self.entry(session_id, agent_id).await?;
        let mut current = entry.lock().await;

        let rejection = match send_agent_event(&current, &event) {
            Ok(next) => {
                self.record(session_id, agent_id, &next).await?;
                *current = next.clone();
                return Ok(next);
            }
            Err(rejection) => rejection,
        };

        debug!(code = %rejection.code, "agent event rejected");
        if rejection.code == RejectionCode::AgentTurnLimitExceeded {
            let error = AgentEvent::error(rejection.code.as_str(), rejection.message.clone());
            match send_agent_event(&current, &error) {
                Ok(errored) => {
                    self.record(session_id, agent_id, &errored).await?;
                    *current = errored;
                    warn!(turn = current.current_turn, "agent stopped at turn limit");
                }
                Err(e) => warn!(code = %e.code, "could not record turn limit error"),
            }
        }
        Err(rejection.into())
    }

    /// Append a producer payload (chunk, tool call, terminal line, ...) on
    /// behalf of a registered agent
    pub async fn emit(
        &self,
        session_id: &str,
        agent_id: &str,
        payload: impl Into<EventPayload>,
    ) -> Result<Event, ServiceError> {
        self.entry(session_id, agent_id).await?;
        self.broker
            .publish(&StreamId::new(session_id), payload)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))
    }

    /// Forget every in-memory agent of a session. Called once the session
    /// is closed; returns how many were dropped.
    pub fn release_session(&self, session_id: &str) -> usize {
        let before = self.agents.len();
        self.agents.retain(|(session, _), _| session != session_id);
        let released = before.saturating_sub(self.agents.len());
        if released > 0 {
            debug!(session_id, released, "released agents of closed session");
        }
        released
    }

    /// Agents currently held in memory
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    async fn record(
        &self,
        session_id: &str,
        agent_id: &str,
        context: &AgentLifecycleContext,
    ) -> Result<(), ServiceError> {
        let data = AgentStateData {
            agent_id: agent_id.to_string(),
            context: context.clone(),
        };
        self.broker
            .publish(&StreamId::new(session_id), data)
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;
        Ok(())
    }

    async fn entry(&self, session_id: &str, agent_id: &str) -> Result<AgentEntry, ServiceError> {
        let key = (session_id.to_string(), agent_id.to_string());
        if let Some(entry) = self.agents.get(&key) {
            return Ok(entry.value().clone());
        }

        let context = self.load(session_id, agent_id).await?;
        let head = self
            .broker
            .head(&StreamId::new(session_id))
            .await
            .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;
        if head.closed {
            // Readable, but not worth keeping once the session is gone
            return Ok(Arc::new(Mutex::new(context)));
        }
        let entry = self
            .agents
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(context)));
        Ok(entry.value().clone())
    }

    /// Rebuild a context from the agent's last `agent_state` event
    async fn load(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<AgentLifecycleContext, ServiceError> {
        let latest = replay_latest(&self.broker, &StreamId::new(session_id), |payload| {
            match payload {
                EventPayload::AgentState(data) if data.agent_id == agent_id => Some(data.context),
                _ => None,
            }
        })
        .await
        .map_err(|e| ServiceError::from_broker(e, format!("session {}", session_id)))?;

        latest.ok_or_else(|| ServiceError::NotFound(format!("agent {}", agent_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdeck_core::{AgentStatus, Channel, ChunkData, Offset};
    use agentdeck_durable::{
        BrokerConfig, EventLog, InMemoryEventLog, LogError, StreamHead, StreamSchema,
    };
    use std::time::Duration;

    fn tools(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn service_with_session() -> (AgentService, StreamBroker) {
        let broker = StreamBroker::new(Arc::new(InMemoryEventLog::new()), BrokerConfig::default());
        broker
            .create_stream(&StreamId::new("s1"), StreamSchema::All)
            .await
            .unwrap();
        (AgentService::new(broker.clone()), broker)
    }

    #[tokio::test]
    async fn test_register_requires_session() {
        let broker = StreamBroker::new(Arc::new(InMemoryEventLog::new()), BrokerConfig::default());
        let service = AgentService::new(broker);
        let err = service
            .register("missing", "a1", 5, tools(&["bash"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_register_twice_is_already_exists() {
        let (service, _) = service_with_session().await;
        service.register("s1", "a1", 5, tools(&["bash"])).await.unwrap();
        let err = service
            .register("s1", "a1", 5, tools(&["bash"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    /// In-memory log whose appends suspend, like a database round trip
    struct SlowAppendLog(InMemoryEventLog);

    #[async_trait::async_trait]
    impl EventLog for SlowAppendLog {
        async fn create_stream(
            &self,
            stream_id: &StreamId,
            schema: StreamSchema,
        ) -> Result<(), LogError> {
            self.0.create_stream(stream_id, schema).await
        }

        async fn append(
            &self,
            stream_id: &StreamId,
            channel: Channel,
            payload: serde_json::Value,
        ) -> Result<Event, LogError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.append(stream_id, channel, payload).await
        }

        async fn read(
            &self,
            stream_id: &StreamId,
            from_offset: Offset,
            limit: usize,
        ) -> Result<Vec<Event>, LogError> {
            self.0.read(stream_id, from_offset, limit).await
        }

        async fn head(&self, stream_id: &StreamId) -> Result<StreamHead, LogError> {
            self.0.head(stream_id).await
        }

        async fn close_stream(&self, stream_id: &StreamId) -> Result<(), LogError> {
            self.0.close_stream(stream_id).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_register_records_once() {
        let broker = StreamBroker::new(
            Arc::new(SlowAppendLog(InMemoryEventLog::new())),
            BrokerConfig::default(),
        );
        let id = StreamId::new("s1");
        broker.create_stream(&id, StreamSchema::All).await.unwrap();
        let service = AgentService::new(broker.clone());

        let (first, second) = tokio::join!(
            service.register("s1", "a1", 5, tools(&["bash"])),
            service.register("s1", "a1", 9, tools(&["bash"])),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(ServiceError::AlreadyExists(_))));

        let events = broker.read(&id, 0, 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(service.get("s1", "a1").await.unwrap().max_turns, 5);

        // The reservation is gone once registration settled
        let err = service
            .register("s1", "a1", 5, tools(&["bash"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_release_session_drops_its_agents() {
        let (service, broker) = service_with_session().await;
        broker
            .create_stream(&StreamId::new("s2"), StreamSchema::All)
            .await
            .unwrap();
        service.register("s1", "a1", 5, tools(&["bash"])).await.unwrap();
        service.register("s1", "a2", 5, tools(&["bash"])).await.unwrap();
        service.register("s2", "a1", 5, tools(&["bash"])).await.unwrap();

        broker.close_stream(&StreamId::new("s1")).await.unwrap();
        assert_eq!(service.release_session("s1"), 2);
        assert_eq!(service.len(), 1);

        // Still readable from the log, without being cached again
        let context = service.get("s1", "a1").await.unwrap();
        assert_eq!(context.status, AgentStatus::Idle);
        assert_eq!(service.len(), 1);
    }

    #[tokio::test]
    async fn test_turn_limit_records_agent_error() {
        let (service, broker) = service_with_session().await;
        service.register("s1", "a1", 2, tools(&["bash"])).await.unwrap();
        service.send("s1", "a1", AgentEvent::start("t1")).await.unwrap();
        service.send("s1", "a1", AgentEvent::step()).await.unwrap();
        service.send("s1", "a1", AgentEvent::step()).await.unwrap();

        let err = service
            .send("s1", "a1", AgentEvent::step())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Rejected {
                code: RejectionCode::AgentTurnLimitExceeded,
                ..
            }
        ));

        let context = service.get("s1", "a1").await.unwrap();
        assert_eq!(context.status, AgentStatus::Error);
        assert_eq!(context.current_turn, 2);
        assert_eq!(
            context.error.as_ref().map(|e| e.code.as_str()),
            Some("AGENT_TURN_LIMIT_EXCEEDED")
        );

        let events = broker.read(&StreamId::new("s1"), 0, 100).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.channel, Channel::AgentState);
        assert_eq!(last.payload["context"]["status"], "error");
    }

    #[tokio::test]
    async fn test_tool_rejection_leaves_agent_running() {
        let (service, _) = service_with_session().await;
        service.register("s1", "a1", 5, tools(&["bash"])).await.unwrap();
        service.send("s1", "a1", AgentEvent::start("t1")).await.unwrap();

        let err = service
            .send("s1", "a1", AgentEvent::step_with_tool("rm"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Rejected {
                code: RejectionCode::AgentToolNotAllowed,
                ..
            }
        ));
        assert_eq!(
            service.get("s1", "a1").await.unwrap().status,
            AgentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_context_restored_after_restart() {
        let (service, broker) = service_with_session().await;
        service.register("s1", "a1", 5, tools(&["bash"])).await.unwrap();
        service.send("s1", "a1", AgentEvent::start("t1")).await.unwrap();
        service.send("s1", "a1", AgentEvent::step()).await.unwrap();

        let restarted = AgentService::new(broker);
        let context = restarted.get("s1", "a1").await.unwrap();
        assert_eq!(context.status, AgentStatus::Running);
        assert_eq!(context.current_turn, 1);
    }

    #[tokio::test]
    async fn test_emit_requires_registered_agent() {
        let (service, _) = service_with_session().await;
        let err = service
            .emit("s1", "ghost", ChunkData::new("ghost", 0, "boo"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        service.register("s1", "a1", 5, tools(&["bash"])).await.unwrap();
        let event = service
            .emit("s1", "a1", ChunkData::new("a1", 0, "hi"))
            .await
            .unwrap();
        assert_eq!(event.channel, Channel::Chunk);
    }
}
