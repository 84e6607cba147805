// Server configuration
//
// Everything is read from environment variables (a .env file is loaded by main
// via dotenvy). Missing variables fall back to defaults; malformed ones are
// reported instead of silently ignored.

use std::str::FromStr;
use std::time::Duration;

use agentdeck_durable::{BrokerConfig, JobRegistryConfig};

/// Default number of participants per session when the caller does not say
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 8;

/// Default turn budget for newly registered agents
pub const DEFAULT_MAX_TURNS: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Control plane configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to (BIND_ADDR)
    pub bind_addr: String,
    /// Prefix for all /v1 routes, e.g. "/api" (API_PREFIX)
    pub api_prefix: String,
    /// PostgreSQL connection string; in-memory log when absent (DATABASE_URL)
    pub database_url: Option<String>,
    /// Origins allowed by CORS; empty means same-origin only (CORS_ALLOWED_ORIGINS)
    pub cors_allowed_origins: Vec<String>,
    pub broker: BrokerConfig,
    pub jobs: JobRegistryConfig,
    pub default_max_participants: u32,
    pub default_max_turns: u32,
    /// How often idle sessions are offered a TIMEOUT (SESSION_REAP_INTERVAL_SECS)
    pub session_reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            api_prefix: String::new(),
            database_url: None,
            cors_allowed_origins: Vec::new(),
            broker: BrokerConfig::default(),
            jobs: JobRegistryConfig::default(),
            default_max_participants: DEFAULT_MAX_PARTICIPANTS,
            default_max_turns: DEFAULT_MAX_TURNS,
            session_reap_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load from process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source (tests pass a map)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let mut broker = defaults.broker.clone();
        if let Some(size) = parse::<usize>(&get, "BROKER_BATCH_SIZE")? {
            broker = broker.with_batch_size(size);
        }
        if let Some(ms) = parse::<u64>(&get, "BROKER_POLL_INTERVAL_MS")? {
            broker = broker.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(max) = parse::<usize>(&get, "MAX_SUBSCRIBERS_PER_STREAM")? {
            broker = broker.with_max_subscribers_per_stream(max);
        }

        let mut jobs = defaults.jobs.clone();
        if let Some(max) = parse::<usize>(&get, "JOB_MAX_ENTRIES")? {
            jobs = jobs.with_max_entries(max);
        }
        if let Some(secs) = parse::<u64>(&get, "JOB_IDLE_TTL_SECS")? {
            jobs = jobs.with_idle_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = parse::<u64>(&get, "JOB_SWEEP_INTERVAL_SECS")? {
            jobs = jobs.with_sweep_interval(Duration::from_secs(secs));
        }

        let cors_allowed_origins = get("CORS_ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            api_prefix: get("API_PREFIX").unwrap_or(defaults.api_prefix),
            database_url: get("DATABASE_URL"),
            cors_allowed_origins,
            broker,
            jobs,
            default_max_participants: parse(&get, "DEFAULT_MAX_PARTICIPANTS")?
                .unwrap_or(defaults.default_max_participants),
            default_max_turns: parse(&get, "DEFAULT_MAX_TURNS")?
                .unwrap_or(defaults.default_max_turns),
            session_reap_interval: parse::<u64>(&get, "SESSION_REAP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_reap_interval),
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
