//! Registry of live job buffers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{JobBuffer, JobError};

/// Job registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRegistryConfig {
    /// Maximum buffers kept; inserting beyond this evicts the least
    /// recently accessed one
    pub max_entries: usize,

    /// Buffers untouched for this long are dropped by the sweeper
    #[serde(with = "duration_secs")]
    pub idle_ttl: Duration,

    /// How often the sweeper runs
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for JobRegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            idle_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl JobRegistryConfig {
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct Entry<T> {
    buffer: Arc<JobBuffer<T>>,
    last_access: Instant,
    access_seq: u64,
}

struct Entries<T> {
    map: HashMap<String, Entry<T>>,
    seq: u64,
}

impl<T> Entries<T> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Owns the job buffers, keyed by job id.
///
/// A buffer leaving the registry (eviction, expiry, reset) is finished:
/// nothing can reach it to publish again. Attached subscribers drain their
/// history and then end.
pub struct JobRegistry<T> {
    config: JobRegistryConfig,
    entries: Mutex<Entries<T>>,
}

impl<T: Clone + Send + Sync + 'static> JobRegistry<T> {
    pub fn new(config: JobRegistryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                seq: 0,
            }),
        }
    }

    pub fn config(&self) -> &JobRegistryConfig {
        &self.config
    }

    /// Register a new job
    pub fn create(&self, job_id: &str) -> Result<Arc<JobBuffer<T>>, JobError> {
        let mut entries = self.entries.lock();
        if entries.map.contains_key(job_id) {
            return Err(JobError::JobAlreadyExists(job_id.to_string()));
        }
        Ok(self.insert(&mut entries, job_id))
    }

    /// Look up a job and mark it accessed
    pub fn get(&self, job_id: &str) -> Option<Arc<JobBuffer<T>>> {
        let mut entries = self.entries.lock();
        let seq = entries.next_seq();
        let entry = entries.map.get_mut(job_id)?;
        entry.last_access = Instant::now();
        entry.access_seq = seq;
        Some(entry.buffer.clone())
    }

    pub fn get_or_create(&self, job_id: &str) -> Arc<JobBuffer<T>> {
        let mut entries = self.entries.lock();
        let seq = entries.next_seq();
        if let Some(entry) = entries.map.get_mut(job_id) {
            entry.last_access = Instant::now();
            entry.access_seq = seq;
            return entry.buffer.clone();
        }
        self.insert(&mut entries, job_id)
    }

    /// Discard a job. Its buffer is finished so blocked subscribers end.
    pub fn reset(&self, job_id: &str) -> bool {
        let removed = self.entries.lock().map.remove(job_id);
        match removed {
            Some(entry) => {
                entry.buffer.finish();
                debug!(job_id, "reset job buffer");
                true
            }
            None => false,
        }
    }

    /// Finish and drop buffers idle for longer than `idle_ttl`. Returns how
    /// many.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.idle_ttl;
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.map.retain(|_, entry| {
                let keep = now.duration_since(entry.last_access) <= ttl;
                if !keep {
                    expired.push(entry.buffer.clone());
                }
                keep
            });
        }
        for buffer in &expired {
            buffer.finish();
            debug!(job_id = buffer.job_id(), "expired idle job buffer");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.lock().map.contains_key(job_id)
    }

    /// Run `evict_expired` every `sweep_interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("job sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = registry.evict_expired();
                        if evicted > 0 {
                            info!(evicted, remaining = registry.len(), "evicted idle job buffers");
                        }
                    }
                }
            }
        })
    }

    fn insert(&self, entries: &mut Entries<T>, job_id: &str) -> Arc<JobBuffer<T>> {
        while entries.map.len() >= self.config.max_entries {
            let oldest = entries
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.access_seq)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    if let Some(evicted) = entries.map.remove(&id) {
                        evicted.buffer.finish();
                    }
                    debug!(job_id = %id, "evicted least recently used job buffer");
                }
                None => break,
            }
        }

        let buffer = Arc::new(JobBuffer::new(job_id));
        let seq = entries.next_seq();
        entries.map.insert(
            job_id.to_string(),
            Entry {
                buffer: buffer.clone(),
                last_access: Instant::now(),
                access_seq: seq,
            },
        );
        buffer
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(config: JobRegistryConfig) -> JobRegistry<u32> {
        JobRegistry::new(config)
    }

    #[test]
    fn test_create_and_get() {
        let registry = registry(JobRegistryConfig::default());
        let created = registry.create("job-1").unwrap();
        created.publish(7).unwrap();

        let fetched = registry.get("job-1").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert!(registry.get("job-2").is_none());
    }

    #[test]
    fn test_create_duplicate() {
        let registry = registry(JobRegistryConfig::default());
        registry.create("job-1").unwrap();
        assert!(matches!(
            registry.create("job-1"),
            Err(JobError::JobAlreadyExists(_))
        ));
    }

    #[test]
    fn test_get_or_create() {
        let registry = registry(JobRegistryConfig::default());
        let a = registry.get_or_create("job-1");
        let b = registry.get_or_create("job-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lru_eviction_on_insert() {
        let registry = registry(JobRegistryConfig::default().with_max_entries(2));
        registry.create("a").unwrap();
        registry.create("b").unwrap();
        // Touch a so b becomes least recently used
        registry.get("a").unwrap();
        registry.create("c").unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
        assert!(registry.contains("c"));
    }

    #[tokio::test]
    async fn test_evicted_buffer_drains_then_ends() {
        let registry = registry(JobRegistryConfig::default().with_max_entries(1));
        let buffer = registry.create("a").unwrap();
        buffer.publish(1).unwrap();
        let mut sub = buffer.subscribe(0);
        assert_eq!(sub.next().await.unwrap().item, 1);
        buffer.publish(2).unwrap();

        registry.create("b").unwrap();
        assert!(!registry.contains("a"));
        assert!(buffer.is_finished());
        assert!(matches!(buffer.publish(3), Err(JobError::JobFinished(_))));

        assert_eq!(sub.next().await.unwrap().item, 2);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reset_finishes_buffer() {
        let registry = registry(JobRegistryConfig::default());
        let buffer = registry.create("a").unwrap();
        let mut sub = buffer.subscribe(0);

        assert!(registry.reset("a"));
        assert!(!registry.reset("a"));
        assert!(buffer.is_finished());
        assert!(sub.next().await.is_none());

        // The id can be reused with fresh history
        let fresh = registry.create("a").unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let registry =
            registry(JobRegistryConfig::default().with_idle_ttl(Duration::from_secs(60)));
        let old = registry.create("old").unwrap();
        let mut sub = old.subscribe(0);
        tokio::time::advance(Duration::from_secs(45)).await;
        registry.create("new").unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(registry.evict_expired(), 1);
        assert!(!registry.contains("old"));
        assert!(registry.contains("new"));
        assert!(old.is_finished());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper() {
        let registry = Arc::new(registry(
            JobRegistryConfig::default()
                .with_idle_ttl(Duration::from_secs(10))
                .with_sweep_interval(Duration::from_secs(5)),
        ));
        registry.create("a").unwrap();

        let cancel = CancellationToken::new();
        let handle = registry.spawn_sweeper(cancel.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
