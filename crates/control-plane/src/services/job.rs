// Job service
//
// Progress reporting for short-lived background pipelines. Nothing here is
// persisted: updates live in a JobBuffer until the registry finishes and
// drops it (explicit reset, idle expiry or the population bound).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use agentdeck_core::Offset;
use agentdeck_durable::{JobError, JobRegistry, JobRegistryConfig, JobSubscription};

use super::{now_millis, ServiceError};

/// One progress update of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Pipeline stage, e.g. "clone" or "build"
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Percent complete, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Set by the service when left at zero
    #[serde(default)]
    pub timestamp: i64,
}

impl JobUpdate {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: None,
            progress: None,
            timestamp: 0,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }
}

pub struct JobService {
    registry: Arc<JobRegistry<JobUpdate>>,
}

impl JobService {
    pub fn new(config: JobRegistryConfig) -> Self {
        Self {
            registry: Arc::new(JobRegistry::new(config)),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry<JobUpdate>> {
        &self.registry
    }

    /// Start a job, generating an id when none is given
    pub fn start(&self, job_id: Option<&str>) -> Result<String, ServiceError> {
        let job_id = job_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        self.registry.create(&job_id)?;
        info!(job_id = %job_id, "job started");
        Ok(job_id)
    }

    pub fn report(&self, job_id: &str, mut update: JobUpdate) -> Result<Offset, ServiceError> {
        let buffer = self
            .registry
            .get(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
        if update.timestamp == 0 {
            update.timestamp = now_millis();
        }
        let offset = buffer.publish(update)?;
        debug!(job_id, offset, "job update published");
        Ok(offset)
    }

    /// Mark a job finished; subscribers end after the last update
    pub fn finish(&self, job_id: &str) -> Result<(), ServiceError> {
        let buffer = self
            .registry
            .get(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
        buffer.finish();
        info!(job_id, updates = buffer.len(), "job finished");
        Ok(())
    }

    pub fn subscribe(
        &self,
        job_id: &str,
        from_offset: Offset,
    ) -> Result<JobSubscription<JobUpdate>, ServiceError> {
        let buffer = self
            .registry
            .get(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
        Ok(buffer.subscribe(from_offset))
    }

    /// Drop a job and end its subscribers
    pub fn reset(&self, job_id: &str) -> bool {
        self.registry.reset(job_id)
    }

    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.registry.spawn_sweeper(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JobService {
        JobService::new(JobRegistryConfig::default())
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_then_ends() {
        let service = service();
        let job_id = service.start(Some("sync-1")).unwrap();
        service.report(&job_id, JobUpdate::new("clone")).unwrap();
        service
            .report(&job_id, JobUpdate::new("index").with_progress(150))
            .unwrap();
        service.finish(&job_id).unwrap();

        let mut sub = service.subscribe(&job_id, 0).unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.item.stage, "clone");
        assert!(first.item.timestamp > 0);
        let second = sub.next().await.unwrap();
        assert_eq!(second.item.progress, Some(100));
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let service = service();
        let a = service.start(None).unwrap();
        let b = service.start(None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_report_after_finish_fails() {
        let service = service();
        service.start(Some("j")).unwrap();
        service.finish("j").unwrap();
        let err = service.report("j", JobUpdate::new("late")).unwrap_err();
        assert!(matches!(err, ServiceError::Job(JobError::JobFinished(_))));
    }

    #[test]
    fn test_unknown_job() {
        let service = service();
        assert!(matches!(
            service.subscribe("nope", 0),
            Err(ServiceError::Job(JobError::JobNotFound(_)))
        ));
        assert!(!service.reset("nope"));
    }

    #[tokio::test]
    async fn test_evicted_job_ends_its_subscribers() {
        let service = JobService::new(JobRegistryConfig::default().with_max_entries(1));
        service.start(Some("a")).unwrap();
        service.report("a", JobUpdate::new("clone")).unwrap();
        let mut sub = service.subscribe("a", 0).unwrap();
        assert_eq!(sub.next().await.unwrap().item.stage, "clone");

        // Starting "b" pushes "a" out of the registry
        service.start(Some("b")).unwrap();
        assert!(matches!(
            service.finish("a"),
            Err(ServiceError::Job(JobError::JobNotFound(_)))
        ));

        let end = tokio::time::timeout(std::time::Duration::from_secs(2), sub.next())
            .await
            .expect("subscriber of an evicted job must end");
        assert!(end.is_none());
        assert_eq!(sub.cursor(), 1);
    }

    #[test]
    fn test_duplicate_start() {
        let service = service();
        service.start(Some("j")).unwrap();
        assert!(matches!(
            service.start(Some("j")),
            Err(ServiceError::Job(JobError::JobAlreadyExists(_)))
        ));
    }
}
