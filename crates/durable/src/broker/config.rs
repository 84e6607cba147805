//! Broker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Subscriber broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Events fetched from the log per read
    pub batch_size: usize,

    /// Upper bound on how long an idle subscriber sleeps before re-reading
    /// the log. Covers writers in other processes that share the log.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum concurrent subscribers per stream
    pub max_subscribers_per_stream: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval: Duration::from_secs(1),
            max_subscribers_per_stream: 1024,
        }
    }
}

impl BrokerConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        // A zero batch would never make progress
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_subscribers_per_stream(mut self, max: usize) -> Self {
        self.max_subscribers_per_stream = max;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
