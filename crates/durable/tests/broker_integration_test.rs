//! End-to-end tests for the broker and job buffers over the in-memory log
//!
//! Run with: cargo test -p agentdeck-durable --test broker_integration_test

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_pending, assert_ready, task};

use agentdeck_core::{
    ChunkData, EventPayload, SessionProjection, StreamId, TerminalData, TerminalStream,
    ToolCallData,
};
use agentdeck_durable::{
    BrokerConfig, BrokerError, InMemoryEventLog, JobBuffer, JobRegistry, JobRegistryConfig,
    StreamBroker, StreamSchema,
};

fn broker() -> StreamBroker {
    StreamBroker::new(
        Arc::new(InMemoryEventLog::new()),
        BrokerConfig::default().with_poll_interval(Duration::from_secs(3600)),
    )
}

async fn new_stream(broker: &StreamBroker) -> StreamId {
    let id = StreamId::from(uuid::Uuid::now_v7());
    broker.create_stream(&id, StreamSchema::All).await.unwrap();
    id
}

// ============================================
// Wakeup Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_pending_subscriber_woken_by_append() {
    let broker = broker();
    let id = new_stream(&broker).await;
    let mut sub = broker.subscribe(&id, 0).await.unwrap();

    {
        let mut next = task::spawn(sub.next());
        assert_pending!(next.poll());

        broker.publish(&id, ChunkData::new("a1", 0, "hi")).await.unwrap();
        assert!(next.is_woken());

        let event = assert_ready!(next.poll()).unwrap().unwrap();
        assert_eq!(event.offset, 0);
    }

    assert_eq!(sub.cursor(), 1);
}

#[test_log::test(tokio::test)]
async fn test_pending_subscriber_woken_by_close() {
    let broker = broker();
    let id = new_stream(&broker).await;
    let mut sub = broker.subscribe(&id, 0).await.unwrap();

    let mut next = task::spawn(sub.next());
    assert_pending!(next.poll());

    broker.close_stream(&id).await.unwrap();
    assert!(next.is_woken());
    assert!(assert_ready!(next.poll()).is_none());
}

#[test_log::test(tokio::test)]
async fn test_pending_job_subscriber_woken_by_publish_and_finish() {
    let buffer: Arc<JobBuffer<String>> = Arc::new(JobBuffer::new("sync-42"));
    let mut sub = buffer.subscribe(0);

    {
        let mut next = task::spawn(sub.next());
        assert_pending!(next.poll());
        buffer.publish("fetching".to_string()).unwrap();
        assert!(next.is_woken());
        assert_eq!(assert_ready!(next.poll()).unwrap().item, "fetching");
    }

    let mut next = task::spawn(sub.next());
    assert_pending!(next.poll());
    buffer.finish();
    assert!(next.is_woken());
    assert!(assert_ready!(next.poll()).is_none());
}

// ============================================
// Resume Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_resume_from_cursor_after_disconnect() {
    let broker = broker();
    let id = new_stream(&broker).await;
    for text in ["a", "b", "c"] {
        broker.publish(&id, ChunkData::new("a1", 0, text)).await.unwrap();
    }

    let mut first = broker.subscribe(&id, 0).await.unwrap();
    first.next().await.unwrap().unwrap();
    first.next().await.unwrap().unwrap();
    let checkpoint = first.cursor();
    drop(first);
    assert_eq!(broker.subscriber_count(&id), 0);

    broker.publish(&id, ChunkData::new("a1", 0, "d")).await.unwrap();
    broker.close_stream(&id).await.unwrap();

    let mut resumed = broker.subscribe(&id, checkpoint).await.unwrap();
    let mut offsets = Vec::new();
    while let Some(event) = resumed.next().await {
        offsets.push(event.unwrap().offset);
    }
    assert_eq!(offsets, vec![2, 3]);
}

// ============================================
// Projection Over Subscription
// ============================================

#[test_log::test(tokio::test)]
async fn test_projection_fed_by_live_subscription() {
    let broker = broker();
    let id = new_stream(&broker).await;

    let sub = broker.subscribe(&id, 0).await.unwrap();
    let consumer = tokio::spawn(async move {
        let mut sub = sub;
        let mut projection = SessionProjection::new();
        while let Some(event) = sub.next().await {
            projection.apply(&event.unwrap());
        }
        projection
    });

    let payloads: Vec<EventPayload> = vec![
        ChunkData::new("a1", 0, "He").into(),
        ToolCallData::started("c1", "bash", serde_json::json!({"cmd": "ls"})).into(),
        ChunkData::new("a1", 0, "llo").into(),
        TerminalData {
            terminal_id: "t1".into(),
            stream: TerminalStream::Stdout,
            line: "README.md".into(),
        }
        .into(),
        ToolCallData::completed("c1", "bash", serde_json::json!("README.md")).into(),
        ChunkData::new("a1", 0, " world").into(),
    ];
    for payload in payloads {
        broker.publish(&id, payload).await.unwrap();
    }
    broker.close_stream(&id).await.unwrap();

    let projection = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(projection.message(&id, "a1", 0).unwrap().text, "Hello world");
    assert_eq!(projection.terminal(&id).len(), 1);
    assert_eq!(projection.last_applied(&id), Some(5));
}

// ============================================
// Limits and Shutdown
// ============================================

#[test_log::test(tokio::test)]
async fn test_many_streams_independent() {
    let broker = broker();
    let a = new_stream(&broker).await;
    let b = new_stream(&broker).await;

    broker.publish(&a, ChunkData::new("x", 0, "1")).await.unwrap();
    broker.publish(&a, ChunkData::new("x", 0, "2")).await.unwrap();
    let first_b = broker.publish(&b, ChunkData::new("y", 0, "1")).await.unwrap();

    assert_eq!(first_b.offset, 0);
    assert_eq!(broker.head(&a).await.unwrap().next_offset, 2);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_refuses_new_subscribers() {
    let broker = broker();
    let id = new_stream(&broker).await;
    broker.shutdown();

    assert!(matches!(
        broker.subscribe(&id, 0).await,
        Err(BrokerError::Shutdown)
    ));
}

#[test_log::test(tokio::test)]
async fn test_job_registry_late_subscriber() {
    let registry: JobRegistry<String> = JobRegistry::new(JobRegistryConfig::default());
    let job = registry.create("provision-1").unwrap();
    job.publish("pulling image".into()).unwrap();
    job.publish("starting container".into()).unwrap();
    job.finish();

    let mut sub = registry.get("provision-1").unwrap().subscribe(0);
    let mut items = Vec::new();
    while let Some(item) = sub.next().await {
        items.push(item.item);
    }
    assert_eq!(items, vec!["pulling image", "starting container"]);
}
