//! Metrics for observability.
//!
//! Two layers:
//!
//! - [`StreamerMetrics`]: per-streamer atomic counters under the
//!   operator-facing names (`I2K_EVTS_SNT_CNT`, `K2I_MSGS_SNT_CNT`, ...),
//!   readable in-process through [`StreamerMetrics::snapshot`].
//! - Free functions over the `metrics` facade, exported to whatever recorder
//!   the embedding process installs (Prometheus, statsd, ...).
//!
//! Every `StreamerMetrics` update is mirrored into the facade.
//!
//! # Metric Naming Convention
//!
//! Facade metrics are prefixed with `cdc_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Monotonicity
//!
//! Counters only ever `fetch_add`. Timestamp gauges use `fetch_max`, so
//! concurrent workers reporting out of order can never move them backwards.

use metrics::{counter, gauge, histogram};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Timestamp (epoch ms) of the last event sent by the source.
pub const I2K_LAST_EVT_SNT_TIME: &str = "I2K_LAST_EVT_SNT_TIME";
/// Events sent by the source.
pub const I2K_EVTS_SNT_CNT: &str = "I2K_EVTS_SNT_CNT";
/// Bytes sent by the source.
pub const I2K_BYTES_SNT: &str = "I2K_BYTES_SNT";
/// Timestamp (epoch ms) of the last record received by the destination.
pub const K2I_LAST_EVT_RSVD_TIME: &str = "K2I_LAST_EVT_RSVD_TIME";
/// Records received by the destination.
pub const K2I_EVTS_RSVD_CNT: &str = "K2I_EVTS_RSVD_CNT";
/// Timestamp (epoch ms) of the last batch applied to the local store.
pub const K2I_LAST_MSG_SNT_TIME: &str = "K2I_LAST_MSG_SNT_TIME";
/// Records in batches applied to the local store.
pub const K2I_MSGS_SNT_CNT: &str = "K2I_MSGS_SNT_CNT";

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Replication direction a [`StreamerMetrics`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Source,
    Destination,
}

/// Per-streamer counters.
#[derive(Debug)]
pub struct StreamerMetrics {
    topic: String,
    direction: Direction,
    last_evt_snt_time: AtomicU64,
    evts_snt_cnt: AtomicU64,
    bytes_snt: AtomicU64,
    last_evt_rsvd_time: AtomicU64,
    evts_rsvd_cnt: AtomicU64,
    last_msg_snt_time: AtomicU64,
    msgs_snt_cnt: AtomicU64,
}

impl StreamerMetrics {
    fn new(topic: &str, direction: Direction) -> Self {
        Self {
            topic: topic.to_string(),
            direction,
            last_evt_snt_time: AtomicU64::new(0),
            evts_snt_cnt: AtomicU64::new(0),
            bytes_snt: AtomicU64::new(0),
            last_evt_rsvd_time: AtomicU64::new(0),
            evts_rsvd_cnt: AtomicU64::new(0),
            last_msg_snt_time: AtomicU64::new(0),
            msgs_snt_cnt: AtomicU64::new(0),
        }
    }

    pub fn source(topic: &str) -> Self {
        Self::new(topic, Direction::Source)
    }

    pub fn destination(topic: &str) -> Self {
        Self::new(topic, Direction::Destination)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// A published batch of `events` records totalling `bytes`.
    pub fn record_sent(&self, events: u64, bytes: u64) {
        if events == 0 {
            return;
        }
        self.evts_snt_cnt.fetch_add(events, Ordering::Relaxed);
        self.bytes_snt.fetch_add(bytes, Ordering::Relaxed);
        let ts = now_ms();
        self.last_evt_snt_time.fetch_max(ts, Ordering::Relaxed);

        counter!("cdc_events_sent_total", "topic" => self.topic.clone()).increment(events);
        counter!("cdc_bytes_sent_total", "topic" => self.topic.clone()).increment(bytes);
        gauge!("cdc_last_event_sent_timestamp_ms", "topic" => self.topic.clone()).set(ts as f64);
    }

    /// Records polled from the transport, before decoding.
    pub fn record_received(&self, records: u64) {
        if records == 0 {
            return;
        }
        self.evts_rsvd_cnt.fetch_add(records, Ordering::Relaxed);
        let ts = now_ms();
        self.last_evt_rsvd_time.fetch_max(ts, Ordering::Relaxed);

        counter!("cdc_records_received_total", "topic" => self.topic.clone()).increment(records);
        gauge!("cdc_last_record_received_timestamp_ms", "topic" => self.topic.clone()).set(ts as f64);
    }

    /// A batch applied to the local store and committed.
    pub fn record_applied(&self, records: u64) {
        self.msgs_snt_cnt.fetch_add(records, Ordering::Relaxed);
        let ts = now_ms();
        self.last_msg_snt_time.fetch_max(ts, Ordering::Relaxed);

        counter!("cdc_records_applied_total", "topic" => self.topic.clone()).increment(records);
        gauge!("cdc_last_batch_applied_timestamp_ms", "topic" => self.topic.clone()).set(ts as f64);
    }

    /// Point-in-time values of this direction's metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut values = BTreeMap::new();
        match self.direction {
            Direction::Source => {
                values.insert(I2K_LAST_EVT_SNT_TIME, self.last_evt_snt_time.load(Ordering::Relaxed));
                values.insert(I2K_EVTS_SNT_CNT, self.evts_snt_cnt.load(Ordering::Relaxed));
                values.insert(I2K_BYTES_SNT, self.bytes_snt.load(Ordering::Relaxed));
            }
            Direction::Destination => {
                values.insert(K2I_LAST_EVT_RSVD_TIME, self.last_evt_rsvd_time.load(Ordering::Relaxed));
                values.insert(K2I_EVTS_RSVD_CNT, self.evts_rsvd_cnt.load(Ordering::Relaxed));
                values.insert(K2I_LAST_MSG_SNT_TIME, self.last_msg_snt_time.load(Ordering::Relaxed));
                values.insert(K2I_MSGS_SNT_CNT, self.msgs_snt_cnt.load(Ordering::Relaxed));
            }
        }
        MetricsSnapshot { values }
    }
}

/// Values captured by [`StreamerMetrics::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    values: BTreeMap<&'static str, u64>,
}

impl MetricsSnapshot {
    /// Value of a metric, `None` for names this direction does not export.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

// =============================================================================
// Source Metrics
// =============================================================================

/// Change events skipped by the source, by reason
/// (`cache_filter`, `not_primary`, `replicated`).
pub fn record_events_filtered(topic: &str, reason: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "cdc_events_filtered_total",
        "topic" => topic.to_string(),
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

/// Type descriptor published on a metadata topic.
pub fn record_metadata_published(topic: &str) {
    counter!("cdc_metadata_published_total", "topic" => topic.to_string()).increment(1);
}

/// Record publish latency.
pub fn record_publish_latency(topic: &str, duration: Duration) {
    histogram!("cdc_publish_duration_seconds", "topic" => topic.to_string()).record(duration.as_secs_f64());
}

// =============================================================================
// Destination Metrics
// =============================================================================

/// Record poll latency.
pub fn record_poll_latency(topic: &str, worker: usize, duration: Duration) {
    histogram!(
        "cdc_poll_duration_seconds",
        "topic" => topic.to_string(),
        "worker" => worker.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record resolve-and-apply latency of one batch.
pub fn record_apply_latency(topic: &str, records: usize, duration: Duration) {
    histogram!("cdc_apply_duration_seconds", "topic" => topic.to_string()).record(duration.as_secs_f64());
    histogram!("cdc_apply_batch_size", "topic" => topic.to_string()).record(records as f64);
}

/// Record a record skipped as undecodable (`codec`, `unknown_type`, `wire`).
pub fn record_poisoned_record(topic: &str, reason: &str) {
    counter!(
        "cdc_poisoned_records_total",
        "topic" => topic.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a type descriptor registered with the local store.
pub fn record_type_registered(topic: &str) {
    counter!("cdc_types_registered_total", "topic" => topic.to_string()).increment(1);
}

/// Record how far a partition's last record is behind wall-clock time.
pub fn record_consumer_lag_ms(topic: &str, partition: u32, lag_ms: u64) {
    gauge!(
        "cdc_consumer_lag_ms",
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    )
    .set(lag_ms as f64);
}

/// Record a worker's lifecycle state.
pub fn set_worker_state(topic: &str, worker: usize, state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Running" => 1.0,
        "Stopping" => 2.0,
        _ => -1.0,
    };
    gauge!(
        "cdc_worker_state",
        "topic" => topic.to_string(),
        "worker" => worker.to_string()
    )
    .set(value);
}

/// Gauge for streamer state.
pub fn set_streamer_state(topic: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("cdc_streamer_state", "topic" => topic.to_string()).set(value);
}

// =============================================================================
// Conflict Resolution Metrics
// =============================================================================

/// Record which rule decided a conflict.
pub fn record_resolver_decision(rule: &str, use_new: bool) {
    let decision = if use_new { "use_new" } else { "use_old" };
    counter!(
        "cdc_resolver_decisions_total",
        "rule" => rule.to_string(),
        "decision" => decision
    )
    .increment(1);
}

/// Record a conflict no rule could resolve.
pub fn record_unresolved_conflict(operation: &str) {
    counter!("cdc_unresolved_conflicts_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Resilience Metrics
// =============================================================================

/// Record a retried transient failure.
pub fn record_retry(component: &str, error_kind: &str) {
    counter!(
        "cdc_retries_total",
        "component" => component.to_string(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a bounded retry policy running out.
pub fn record_retries_exhausted(component: &str) {
    counter!("cdc_retries_exhausted_total", "component" => component.to_string()).increment(1);
}

/// Record offset store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn offset_store_retries_total(operation: &str) {
    counter!("cdc_offset_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "cdc_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("cdc_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}
