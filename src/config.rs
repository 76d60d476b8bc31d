//! Configuration for a replication.
//!
//! One [`ReplicationConfig`] describes one replication identifier: where the
//! remote collection lives, how pulls and pushes are sized, how conflicts are
//! settled and where checkpoints are kept. It can be built programmatically or
//! deserialized from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use kinto_replication::config::{ReplicationConfig, RemoteConfig};
//!
//! let config = ReplicationConfig {
//!     replication_identifier: "todos".into(),
//!     remote: RemoteConfig::new("https://kinto.example.com/v1", "app", "todos"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── replication_identifier: String
//! ├── remote: RemoteConfig          # endpoint, bucket/collection, auth, timeout
//! ├── pull: PullConfig              # batch size, long-poll heartbeat
//! ├── push: PushConfig              # batch size
//! ├── strategy: ConflictStrategy    # CLIENT_WINS | SERVER_WINS | PULL_ONLY | MANUAL
//! ├── live / auto_start / wait_for_leadership
//! ├── retry_time / max_backoff      # humantime strings
//! └── checkpoint: CheckpointConfig  # SQLite checkpoint persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "replication_identifier": "todos",
//!   "remote": {
//!     "url": "https://kinto.example.com/v1",
//!     "bucket": "app",
//!     "collection": "todos",
//!     "auth": { "type": "basic", "username": "user", "password": "pass" }
//!   },
//!   "pull": { "batch_size": 200, "heartbeat": "30s" },
//!   "strategy": "SERVER_WINS",
//!   "checkpoint": { "sqlite_path": "/var/lib/app/checkpoints.db" }
//! }
//! ```

use crate::conflict::ConflictStrategy;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound on ids sent in the `exclude_id` filter.
pub const MAX_EXCLUDED_IDS: usize = 50;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to run one replication identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Key for the checkpoint and for logs/metrics. Must be unique per
    /// local collection + remote pair.
    pub replication_identifier: String,

    /// Remote collection endpoint.
    pub remote: RemoteConfig,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub push: PushConfig,

    /// How outgoing conflicts are settled.
    #[serde(default)]
    pub strategy: ConflictStrategy,

    /// Keep replicating after the initial sync (long-poll + periodic push).
    #[serde(default = "default_true")]
    pub live: bool,

    /// Retry interval for failed cycles and the backoff floor (e.g. "5s").
    #[serde(default = "default_retry_time")]
    pub retry_time: String,

    /// Backoff ceiling for the long-poll loop (e.g. "5m").
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// Start replicating as soon as the handle is created.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Only replicate while holding the leader lease.
    #[serde(default = "default_true")]
    pub wait_for_leadership: bool,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_identifier: "default".to_string(),
            remote: RemoteConfig::default(),
            pull: PullConfig::default(),
            push: PushConfig::default(),
            strategy: ConflictStrategy::default(),
            live: true,
            retry_time: default_retry_time(),
            max_backoff: default_max_backoff(),
            auto_start: true,
            wait_for_leadership: true,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a fast-cycling config for tests.
    pub fn for_testing(replication_identifier: &str) -> Self {
        Self {
            replication_identifier: replication_identifier.to_string(),
            remote: RemoteConfig {
                timeout: "2s".to_string(),
                ..RemoteConfig::new("http://127.0.0.1:8888/v1", "default", "test")
            },
            pull: PullConfig {
                heartbeat: "20ms".to_string(),
                ..PullConfig::default()
            },
            push: PushConfig::default(),
            strategy: ConflictStrategy::default(),
            live: true,
            retry_time: "10ms".to_string(),
            max_backoff: "100ms".to_string(),
            auto_start: true,
            wait_for_leadership: true,
            checkpoint: CheckpointConfig::in_memory(),
        }
    }

    /// Check the config before starting.
    pub fn validate(&self) -> Result<()> {
        if self.replication_identifier.trim().is_empty() {
            return Err(ReplicationError::Config(
                "replication_identifier must not be empty".to_string(),
            ));
        }
        if self.pull.batch_size == 0 || self.push.batch_size == 0 {
            return Err(ReplicationError::Config(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        reqwest::Url::parse(&self.remote.url).map_err(|e| {
            ReplicationError::Config(format!("invalid remote url {}: {}", self.remote.url, e))
        })?;
        if self.remote.bucket.is_empty() || self.remote.collection.is_empty() {
            return Err(ReplicationError::Config(
                "bucket and collection must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse `retry_time`, falling back to 5s.
    pub fn retry_time_duration(&self) -> Duration {
        parse_or(&self.retry_time, Duration::from_secs(5))
    }

    /// Parse `max_backoff`, falling back to 5m.
    pub fn max_backoff_duration(&self) -> Duration {
        parse_or(&self.max_backoff, Duration::from_secs(300))
    }

    /// Long-poll backoff schedule: floor `retry_time`, ceiling `max_backoff`.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::forever(self.retry_time_duration(), self.max_backoff_duration())
    }

    /// Whether local writes are pushed.
    pub fn push_enabled(&self) -> bool {
        self.push.enabled && self.strategy.pushes()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteConfig: the Kinto collection endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication applied to every remote request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

/// Remote collection endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Server root, e.g. `https://kinto.example.com/v1`.
    pub url: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_bucket")]
    pub collection: String,

    /// Static headers sent with every request and as batch defaults.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-request timeout (e.g. "30s"). Expiry is a retryable transport error.
    #[serde(default = "default_timeout")]
    pub timeout: String,

    /// Record ids to ignore when pulling. Only the first 50 are sent.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Optional `_expected` timestamp filter for cache busting.
    #[serde(default)]
    pub expected_timestamp: Option<u64>,

    /// Enable request rate limiting.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained requests per second when rate limiting.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst capacity when rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::new("http://localhost:8888/v1", "default", "default")
    }
}

impl RemoteConfig {
    pub fn new(url: &str, bucket: &str, collection: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            collection: collection.to_string(),
            headers: BTreeMap::new(),
            auth: AuthConfig::None,
            timeout: default_timeout(),
            exclude: Vec::new(),
            expected_timestamp: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }

    /// Parse `timeout`, falling back to 30s.
    pub fn timeout_duration(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(30))
    }

    /// `buckets/{bucket}/collections/{collection}`
    pub fn collection_path(&self) -> String {
        format!("buckets/{}/collections/{}", self.bucket, self.collection)
    }

    /// Server-relative path of one record, as used inside batch requests.
    pub fn record_path(&self, id: &str) -> String {
        format!("/{}/records/{}", self.collection_path(), id)
    }

    pub fn collection_url(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.collection_path())
    }

    pub fn records_url(&self) -> String {
        format!("{}/records", self.collection_url())
    }

    pub fn batch_url(&self) -> String {
        format!("{}/batch", self.url.trim_end_matches('/'))
    }

    /// Comma-joined `exclude_id` filter, if any ids are excluded.
    pub fn exclude_filter(&self) -> Option<String> {
        if self.exclude.is_empty() {
            return None;
        }
        Some(
            self.exclude
                .iter()
                .take(MAX_EXCLUDED_IDS)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Get rate limit config if enabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pull / Push
// ═══════════════════════════════════════════════════════════════════════════════

/// Pull pipeline and long-poll settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `_limit` for each list request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Long-poll wait between change requests (e.g. "60s").
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            heartbeat: default_heartbeat(),
        }
    }
}

impl PullConfig {
    /// Parse `heartbeat`, falling back to 60s.
    pub fn heartbeat_duration(&self) -> Duration {
        parse_or(&self.heartbeat, Duration::from_secs(60))
    }
}

/// Push pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum rows per batch write. Kinto rejects a `/batch` with more
    /// sub-requests than its `batch_max_requests` setting (25 by default)
    /// with a 400, so raise this only together with the server setting.
    #[serde(default = "default_push_batch_size")]
    pub batch_size: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_push_batch_size(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite database path. `":memory:"` keeps checkpoints in process memory.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Use WAL journal mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_batch_size() -> usize {
    100
}

fn default_push_batch_size() -> usize {
    25
}

fn default_heartbeat() -> String {
    "60s".to_string()
}

fn default_retry_time() -> String {
    "5s".to_string()
}

fn default_max_backoff() -> String {
    "5m".to_string()
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_bucket() -> String {
    "default".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10
}

fn default_rate_limit_burst() -> u32 {
    20
}

fn default_sqlite_path() -> String {
    "replication_checkpoints.db".to_string()
}
