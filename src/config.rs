//! Configuration for the source and destination streamers.
//!
//! Every type here can be constructed programmatically or deserialized from
//! YAML/JSON by the embedding process. Option names are snake_case; the
//! camelCase spellings (`metadataTopic`, `kafkaPartitions`, ...) are accepted
//! as aliases so existing replication configs load unchanged.
//!
//! # Configuration Structure
//!
//! ```text
//! CdcConfig
//! ├── topology: TopologyConfig        # Local cluster id, conflict field
//! ├── source: SourceConfig            # Local change feed → transport
//! ├── destination: DestinationConfig  # Transport → local store
//! ├── transport: TransportConfig      # Redis Streams connection
//! └── offsets: OffsetStoreConfig      # SQLite committed offsets
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! topology:
//!   local_cluster_id: 1
//!   conflict_field: "modified"
//!
//! source:
//!   topic: "dc1-to-dc2"
//!   metadataTopic: "dc1-to-dc2-meta"
//!   caches: ["people", "orders"]
//!   kafkaPartitions: 16
//!
//! destination:
//!   topic: "dc2-to-dc1"
//!   metadataTopic: "dc2-to-dc1-meta"
//!   kafkaPartsFrom: 0
//!   kafkaPartsTo: 16
//!   threadCount: 4
//!   kafkaRequestTimeout: "3s"
//! ```
//!
//! Durations are human strings (`"3s"`, `"500ms"`). A string that does not
//! parse is a configuration error, reported by `validate()` and by the
//! accessor that reads it.

use crate::error::{CdcError, Result};
use crate::partition::PartitionRange;
use crate::resilience::{RateLimitConfig, RetryPolicy};
use crate::resolver::{ConflictField, ReplicationTopology};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|_| CdcError::Config(format!("{}: invalid duration '{}'", field, value)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to run both directions of replication for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdcConfig {
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub offsets: OffsetStoreConfig,
}

impl CdcConfig {
    /// Create a config for tests: in-memory offsets and fast-fail retries.
    pub fn for_testing(local_cluster_id: u8, send_topic: &str, receive_topic: &str) -> Self {
        Self {
            topology: TopologyConfig {
                local_cluster_id,
                conflict_field: None,
            },
            source: SourceConfig::for_testing(send_topic),
            destination: DestinationConfig::for_testing(receive_topic),
            transport: TransportConfig::default(),
            offsets: OffsetStoreConfig::in_memory(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.topology.validate()?;
        self.source.validate()?;
        self.destination.validate()?;
        self.transport.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TopologyConfig: who we are and how cross-cluster conflicts are broken
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication identity of the local cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Data center id of the local cluster, stamped on every local write.
    #[serde(alias = "clusterId")]
    pub local_cluster_id: u8,

    /// Payload field used to break cross-cluster conflicts.
    /// `None` disables field comparison.
    #[serde(default, alias = "conflictResolveField")]
    pub conflict_field: Option<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            local_cluster_id: 1,
            conflict_field: None,
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(field) = &self.conflict_field {
            ConflictField::parse(field)?;
        }
        Ok(())
    }

    /// Build the resolver topology, parsing the conflict field path.
    pub fn build(&self) -> Result<ReplicationTopology> {
        let topology = ReplicationTopology::new(self.local_cluster_id);
        match &self.conflict_field {
            Some(field) => Ok(topology.with_conflict_field(ConflictField::parse(field)?)),
            None => Ok(topology),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: local changes → transport
// ═══════════════════════════════════════════════════════════════════════════════

/// Source streamer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Data topic records are published to.
    pub topic: String,

    /// Topic carrying type descriptors.
    #[serde(alias = "metadataTopic")]
    pub metadata_topic: String,

    /// Caches to replicate. Empty replicates every cache.
    #[serde(default)]
    pub caches: BTreeSet<String>,

    /// Number of partitions of `topic`.
    #[serde(default = "default_partitions", alias = "kafkaPartitions")]
    pub kafka_partitions: u32,

    /// Maximum events read from the change feed per batch.
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: usize,

    /// Replicate only events observed on the primary copy of a key.
    #[serde(default, alias = "onlyPrimary")]
    pub only_primary: bool,

    /// Upper bound on one publish call (e.g., "3s").
    #[serde(default = "default_request_timeout", alias = "kafkaRequestTimeout")]
    pub kafka_request_timeout: String,

    /// Sleep between change feed reads that returned nothing.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Bodies larger than this many bytes are zstd-compressed (0 disables).
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    #[serde(default)]
    pub retry: RetryPolicyConfig,
}

fn default_partitions() -> u32 {
    16
}

fn default_max_batch_size() -> usize {
    1024
}

fn default_request_timeout() -> String {
    "3s".to_string()
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_compression_threshold() -> usize {
    1024
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            topic: "cdc-data".to_string(),
            metadata_topic: "cdc-meta".to_string(),
            caches: BTreeSet::new(),
            kafka_partitions: default_partitions(),
            max_batch_size: default_max_batch_size(),
            only_primary: false,
            kafka_request_timeout: default_request_timeout(),
            poll_interval: default_poll_interval(),
            compression_threshold: default_compression_threshold(),
            retry: RetryPolicyConfig::default(),
        }
    }
}

impl SourceConfig {
    pub fn for_testing(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            metadata_topic: format!("{}-meta", topic),
            kafka_partitions: 8,
            max_batch_size: 64,
            kafka_request_timeout: "1s".to_string(),
            poll_interval: "10ms".to_string(),
            retry: RetryPolicyConfig::testing(),
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration("kafka_request_timeout", &self.kafka_request_timeout)
    }

    pub fn poll_interval_duration(&self) -> Result<Duration> {
        parse_duration("poll_interval", &self.poll_interval)
    }

    /// Whether events of `cache` are replicated.
    pub fn includes_cache(&self, cache: &str) -> bool {
        self.caches.is_empty() || self.caches.contains(cache)
    }

    pub fn validate(&self) -> Result<()> {
        validate_topics(&self.topic, &self.metadata_topic)?;
        if self.kafka_partitions == 0 {
            return Err(CdcError::Config("kafka_partitions must be > 0".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(CdcError::Config("max_batch_size must be > 0".to_string()));
        }
        self.request_timeout()?;
        self.poll_interval_duration()?;
        self.retry.validate()
    }
}

fn validate_topics(topic: &str, metadata_topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        return Err(CdcError::Config("topic must not be empty".to_string()));
    }
    if metadata_topic.trim().is_empty() {
        return Err(CdcError::Config("metadata_topic must not be empty".to_string()));
    }
    if topic == metadata_topic {
        return Err(CdcError::Config(format!(
            "topic and metadata_topic must differ (both '{}')",
            topic
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// DestinationConfig: transport → local store
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination streamer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Data topic to consume.
    pub topic: String,

    /// Topic carrying type descriptors.
    #[serde(alias = "metadataTopic")]
    pub metadata_topic: String,

    /// Caches to apply. Empty applies every cache.
    #[serde(default)]
    pub caches: BTreeSet<String>,

    /// First partition owned by this instance (inclusive).
    #[serde(default, alias = "kafkaPartsFrom")]
    pub kafka_parts_from: u32,

    /// End of the owned partition range (exclusive).
    #[serde(default = "default_partitions", alias = "kafkaPartsTo")]
    pub kafka_parts_to: u32,

    /// Number of workers; each owns a contiguous slice of the range.
    #[serde(default = "default_thread_count", alias = "threadCount")]
    pub thread_count: usize,

    /// Maximum records per poll.
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: usize,

    /// Upper bound on one poll (e.g., "3s").
    #[serde(default = "default_request_timeout", alias = "kafkaRequestTimeout")]
    pub kafka_request_timeout: String,

    /// Consumer group whose offsets are committed. Stable across restarts.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// How long shutdown waits for each worker to finish its batch.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Throttle records applied to the local store.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained records per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    #[serde(default)]
    pub retry: RetryPolicyConfig,
}

fn default_thread_count() -> usize {
    4
}

fn default_group_id() -> String {
    "cdc-replication".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            topic: "cdc-data".to_string(),
            metadata_topic: "cdc-meta".to_string(),
            caches: BTreeSet::new(),
            kafka_parts_from: 0,
            kafka_parts_to: default_partitions(),
            thread_count: default_thread_count(),
            max_batch_size: default_max_batch_size(),
            kafka_request_timeout: default_request_timeout(),
            group_id: default_group_id(),
            drain_timeout: default_drain_timeout(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            retry: RetryPolicyConfig::default(),
        }
    }
}

impl DestinationConfig {
    pub fn for_testing(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            metadata_topic: format!("{}-meta", topic),
            kafka_parts_from: 0,
            kafka_parts_to: 8,
            thread_count: 2,
            max_batch_size: 64,
            kafka_request_timeout: "50ms".to_string(),
            drain_timeout: "2s".to_string(),
            retry: RetryPolicyConfig::testing_unbounded(),
            ..Default::default()
        }
    }

    pub fn partition_range(&self) -> Result<PartitionRange> {
        PartitionRange::new(self.kafka_parts_from, self.kafka_parts_to)
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration("kafka_request_timeout", &self.kafka_request_timeout)
    }

    pub fn drain_timeout_duration(&self) -> Result<Duration> {
        parse_duration("drain_timeout", &self.drain_timeout)
    }

    /// Whether records of `cache` are applied.
    pub fn includes_cache(&self, cache: &str) -> bool {
        self.caches.is_empty() || self.caches.contains(cache)
    }

    /// Rate limiter settings, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_topics(&self.topic, &self.metadata_topic)?;
        if self.max_batch_size == 0 {
            return Err(CdcError::Config("max_batch_size must be > 0".to_string()));
        }
        if self.group_id.trim().is_empty() {
            return Err(CdcError::Config("group_id must not be empty".to_string()));
        }
        let range = self.partition_range()?;
        range.split(self.thread_count)?;
        self.request_timeout()?;
        self.drain_timeout_duration()?;
        self.retry.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryPolicyConfig: transient failure handling
// ═══════════════════════════════════════════════════════════════════════════════

/// Serialized form of [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Attempts before giving up. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicyConfig {
    /// Three attempts, millisecond delays.
    pub fn testing() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
        }
    }

    /// Retry forever, millisecond delays.
    pub fn testing_unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::testing()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(CdcError::Config("retry.max_attempts must be > 0".to_string()));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(CdcError::Config(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        self.to_policy().map(|_| ())
    }

    pub fn to_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(usize::MAX),
            initial_delay: parse_duration("retry.initial_delay", &self.initial_delay)?,
            max_delay: parse_duration("retry.max_delay", &self.max_delay)?,
            backoff_factor: self.backoff_factor,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig: Redis Streams connection
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Example: `"redis://log.example.com:6379"`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prepended to every stream key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Multiplexed connections; blocking reads hold one each.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Timeout for each connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "cdc:".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn for_testing(redis_url: &str) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            pool_size: 2,
            connect_timeout: "500ms".to_string(),
            ..Default::default()
        }
    }

    pub fn connect_timeout_duration(&self) -> Result<Duration> {
        parse_duration("connect_timeout", &self.connect_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis_url.trim().is_empty() {
            return Err(CdcError::Config("redis_url must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(CdcError::Config("pool_size must be > 0".to_string()));
        }
        self.connect_timeout_duration().map(|_| ())
    }

    /// Stream key of one data partition.
    pub fn partition_key(&self, topic: &str, partition: u32) -> String {
        format!("{}{}:{}", self.key_prefix, topic, partition)
    }

    /// Stream key of a metadata topic.
    pub fn metadata_key(&self, topic: &str) -> String {
        format!("{}{}", self.key_prefix, topic)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OffsetStoreConfig: committed offset persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Committed offset persistence configuration.
///
/// Offsets live in SQLite next to the destination so a restart resumes from
/// the last applied batch regardless of transport retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetStoreConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OffsetStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "cdc_offsets.db".to_string(),
            wal_mode: true,
        }
    }
}

impl OffsetStoreConfig {
    /// Create an in-memory config for testing.
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

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
