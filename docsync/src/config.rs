//! Server configuration.
//!
//! `ServerConfig::default()` is the production baseline, `for_testing()`
//! shrinks every interval so tests finish quickly, and `from_env()` overlays
//! `DOCSYNC_*` environment variables on top of the defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which merge engine the hub folds updates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Yrs v1 updates (default)
    Yrs,
    /// Grow-only set of opaque updates
    UpdateSet,
}

impl FromStr for MergeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yrs" | "yjs" => Ok(MergeKind::Yrs),
            "set" | "gset" | "update-set" => Ok(MergeKind::UpdateSet),
            other => Err(ConfigError::Invalid {
                key: "DOCSYNC_MERGE",
                value: other.to_string(),
            }),
        }
    }
}

/// Retry schedule for calls into durable storage during compaction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further failure
    pub initial_backoff: Duration,
    /// Upper bound for the doubled delay
    pub max_backoff: Duration,
    /// Per-call timeout for a single load/save round
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Retention of the per-room update log kept in the shared cache.
#[derive(Debug, Clone)]
pub struct LogRetention {
    /// Oldest entries are dropped beyond this count
    pub max_entries: usize,
    /// Entries older than this are dropped
    pub ttl: Duration,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// URL prefix in front of the room id, e.g. `/ws/yjs/{room}`
    pub path_prefix: String,
    /// Durable storage path (None = in-memory document store)
    pub storage_path: Option<PathBuf>,
    /// Merge engine
    pub merge: MergeKind,
    /// Frames buffered per session before the session is disconnected
    pub outbound_queue: usize,
    /// Largest accepted update payload in bytes
    pub max_update_bytes: usize,
    /// TTL of room state in the shared cache
    pub state_ttl: Duration,
    /// Interval of the background compaction/cleanup pass
    pub flush_interval: Duration,
    /// Retry schedule for durable writes
    pub retry: RetryPolicy,
    /// Update log retention
    pub log_retention: LogRetention,
    /// Rooms created at startup (the binary's stand-in for an external
    /// document service)
    pub seed_rooms: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            path_prefix: "/ws/yjs".to_string(),
            storage_path: None,
            merge: MergeKind::Yrs,
            outbound_queue: 256,
            max_update_bytes: 16 * 1024 * 1024, // 16MB
            state_ttl: Duration::from_secs(30 * 60),
            flush_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            log_retention: LogRetention::default(),
            seed_rooms: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Config for testing (ephemeral port, fast retries, opaque updates).
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            merge: MergeKind::UpdateSet,
            outbound_queue: 64,
            max_update_bytes: 1024 * 1024,
            flush_interval: Duration::from_millis(100),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                timeout: Duration::from_millis(500),
            },
            ..Self::default()
        }
    }

    /// Defaults overlaid with `DOCSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("DOCSYNC_BIND") {
            config.bind_addr = v;
        }
        if let Some(v) = lookup("DOCSYNC_PATH_PREFIX") {
            config.path_prefix = v;
        }
        if let Some(v) = lookup("DOCSYNC_STORAGE_PATH") {
            config.storage_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("DOCSYNC_MERGE") {
            config.merge = v.parse()?;
        }
        if let Some(v) = lookup("DOCSYNC_OUTBOUND_QUEUE") {
            config.outbound_queue = parse_number("DOCSYNC_OUTBOUND_QUEUE", &v)?;
        }
        if let Some(v) = lookup("DOCSYNC_MAX_UPDATE_BYTES") {
            config.max_update_bytes = parse_number("DOCSYNC_MAX_UPDATE_BYTES", &v)?;
        }
        if let Some(v) = lookup("DOCSYNC_STATE_TTL_SECS") {
            config.state_ttl = Duration::from_secs(parse_number("DOCSYNC_STATE_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("DOCSYNC_FLUSH_INTERVAL_SECS") {
            config.flush_interval =
                Duration::from_secs(parse_number("DOCSYNC_FLUSH_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("DOCSYNC_SEED_ROOMS") {
            config.seed_rooms = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid {
                key: "outbound_queue",
                value: "0".into(),
            });
        }
        if !self.path_prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "path_prefix",
                value: self.path_prefix.clone(),
            });
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "flush_interval",
                value: "0".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "retry.max_attempts",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
