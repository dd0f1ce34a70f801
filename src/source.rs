// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source streamer: local change feed → transport.
//!
//! Each pass reads up to `max_batch_size` events from the feed, filters them,
//! announces any new entry types on the metadata topic, publishes the batch
//! to the data topic and only then commits the feed position.
//!
//! ```text
//! feed.next_batch ─► filter ─► metadata (new types) ─► publish ─► feed.commit
//!                    │                                   │
//!                    ├ cache not replicated              └ retried with the
//!                    ├ not primary (only_primary)          same batch until
//!                    └ written by replication              acknowledged
//! ```
//!
//! A crash between publish and commit resends the batch. The destination
//! absorbs the duplicates through conflict resolution.
//!
//! # Echo Suppression
//!
//! Entries written on this cluster by a destination streamer keep the
//! version of the cluster that produced them. Such events are skipped, so
//! in active-active topologies a change is never bounced back to its origin.

use crate::codec::{encode_entry, TypeDescriptor};
use crate::config::SourceConfig;
use crate::error::{CdcError, Result};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::metrics::{self, StreamerMetrics};
use crate::partition::partition_for_key;
use crate::resilience::{retry_transient, RetryPolicy};
use crate::transport::{OutboundRecord, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of one [`SourceStreamer::process_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatchResult {
    /// Events read from the feed.
    pub read: usize,
    /// Records published to the data topic.
    pub sent: usize,
    /// Bytes published to the data topic.
    pub bytes: usize,
    /// Events skipped by a filter.
    pub filtered: usize,
    /// Events that could not be encoded.
    pub poisoned: usize,
    /// Type descriptors announced on the metadata topic.
    pub metadata_published: usize,
}

impl SourceBatchResult {
    pub fn is_empty(&self) -> bool {
        self.read == 0
    }
}

#[derive(Default)]
struct Filtered {
    cache: usize,
    not_primary: usize,
    replicated: usize,
}

impl Filtered {
    fn total(&self) -> usize {
        self.cache + self.not_primary + self.replicated
    }
}

/// Publishes local changes for one data topic.
pub struct SourceStreamer {
    config: SourceConfig,
    local_cluster_id: u8,
    feed: Arc<dyn ChangeFeed>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    request_timeout: Duration,
    poll_interval: Duration,
    metrics: Arc<StreamerMetrics>,
    announced_types: Mutex<HashSet<u32>>,
}

impl SourceStreamer {
    pub fn new(
        config: SourceConfig,
        local_cluster_id: u8,
        feed: Arc<dyn ChangeFeed>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let retry = config.retry.to_policy()?;
        let request_timeout = config.request_timeout()?;
        let poll_interval = config.poll_interval_duration()?;
        let metrics = Arc::new(StreamerMetrics::source(&config.topic));

        Ok(Self {
            config,
            local_cluster_id,
            feed,
            transport,
            retry,
            request_timeout,
            poll_interval,
            metrics,
            announced_types: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Counters for this streamer (`I2K_*`).
    pub fn metrics(&self) -> Arc<StreamerMetrics> {
        Arc::clone(&self.metrics)
    }

    fn skip_reason(&self, event: &ChangeEvent) -> Option<&'static str> {
        if !self.config.includes_cache(&event.cache) {
            return Some("cache_filter");
        }
        if self.config.only_primary && !event.primary {
            return Some("not_primary");
        }
        if event.entry.version.cluster_id != self.local_cluster_id {
            return Some("replicated");
        }
        None
    }

    /// Read, publish and commit one batch from the feed.
    ///
    /// Returns an empty result when the feed had nothing pending. Transient
    /// transport failures are retried under the configured policy; the feed
    /// is not committed unless the publish was acknowledged.
    pub async fn process_once(&self) -> Result<SourceBatchResult> {
        let events = retry_transient(&self.retry, "source", "feed_read", || async {
            self.feed
                .next_batch(self.config.max_batch_size)
                .await
                .map_err(CdcError::from)
        })
        .await?;

        let Some(last_position) = events.last().map(|e| e.position) else {
            return Ok(SourceBatchResult::default());
        };

        let mut result = SourceBatchResult {
            read: events.len(),
            ..Default::default()
        };
        let mut filtered = Filtered::default();
        let mut descriptors: Vec<TypeDescriptor> = Vec::new();
        let mut outbound: Vec<OutboundRecord> = Vec::with_capacity(events.len());

        {
            let announced = self.announced_types.lock().await;
            for event in &events {
                match self.skip_reason(event) {
                    Some("cache_filter") => filtered.cache += 1,
                    Some("not_primary") => filtered.not_primary += 1,
                    Some(_) => filtered.replicated += 1,
                    None => {
                        if let Some(descriptor) = TypeDescriptor::from_entry(&event.entry) {
                            if !announced.contains(&descriptor.type_id)
                                && !descriptors.iter().any(|d| d.type_id == descriptor.type_id)
                            {
                                descriptors.push(descriptor);
                            }
                        }

                        match encode_entry(&event.cache, &event.entry, self.config.compression_threshold) {
                            Ok(record) => outbound.push(OutboundRecord {
                                partition: partition_for_key(&record.key, self.config.kafka_partitions),
                                record,
                            }),
                            Err(e) => {
                                warn!(
                                    cache = %event.cache,
                                    key = %event.entry.key,
                                    position = event.position,
                                    error = %e,
                                    "Skipping change event that cannot be encoded"
                                );
                                result.poisoned += 1;
                            }
                        }
                    }
                }
            }
        }

        let topic = self.config.topic.as_str();
        metrics::record_events_filtered(topic, "cache_filter", filtered.cache);
        metrics::record_events_filtered(topic, "not_primary", filtered.not_primary);
        metrics::record_events_filtered(topic, "replicated", filtered.replicated);
        result.filtered = filtered.total();

        // Types go out before any record that needs them.
        for descriptor in descriptors {
            self.announce_type(&descriptor).await?;
            result.metadata_published += 1;
        }

        if !outbound.is_empty() {
            let bytes: usize = outbound.iter().map(|o| o.record.size_bytes()).sum();
            let start = Instant::now();
            retry_transient(&self.retry, "source", "publish", || self.publish(outbound.clone())).await?;
            metrics::record_publish_latency(topic, start.elapsed());

            result.sent = outbound.len();
            result.bytes = bytes;
            self.metrics.record_sent(result.sent as u64, bytes as u64);
        }

        retry_transient(&self.retry, "source", "feed_commit", || async {
            self.feed.commit(last_position).await.map_err(CdcError::from)
        })
        .await?;

        debug!(
            read = result.read,
            sent = result.sent,
            bytes = result.bytes,
            filtered = result.filtered,
            poisoned = result.poisoned,
            position = last_position,
            "Source batch published"
        );
        Ok(result)
    }

    async fn publish(&self, records: Vec<OutboundRecord>) -> Result<()> {
        let timeout = self.request_timeout;
        match tokio::time::timeout(timeout, self.transport.publish(&self.config.topic, records)).await {
            Ok(result) => result,
            Err(_) => Err(CdcError::transport_msg("publish", format!("timed out after {:?}", timeout))),
        }
    }

    async fn announce_type(&self, descriptor: &TypeDescriptor) -> Result<()> {
        let data = descriptor.encode()?;
        let timeout = self.request_timeout;
        let metadata_topic = self.config.metadata_topic.as_str();

        let offset = retry_transient(&self.retry, "source", "publish_metadata", || async {
            match tokio::time::timeout(timeout, self.transport.publish_metadata(metadata_topic, data.clone())).await {
                Ok(result) => result,
                Err(_) => Err(CdcError::transport_msg("publish_metadata", "timed out")),
            }
        })
        .await?;

        self.announced_types.lock().await.insert(descriptor.type_id);
        metrics::record_metadata_published(metadata_topic);
        info!(
            type_name = %descriptor.type_name,
            type_id = descriptor.type_id,
            offset = %offset,
            "Announced entry type"
        );
        Ok(())
    }

    /// Drain the feed until shutdown is signalled.
    ///
    /// Sleeps `poll_interval` whenever the feed is empty. A pass that is
    /// interrupted by shutdown is abandoned before its feed commit, so its
    /// events are published again by the next run.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("source_streamer", topic = %self.config.topic);
        let idle = self.poll_interval;

        async move {
            info!(
                cluster_id = self.local_cluster_id,
                partitions = self.config.kafka_partitions,
                only_primary = self.config.only_primary,
                "Starting source streamer"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let result = tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }

                    result = self.process_once() => result,
                };

                match result {
                    Ok(batch) if batch.is_empty() => {
                        tokio::select! {
                            biased;
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Source streamer stopped on error");
                        return Err(e);
                    }
                }
            }

            info!("Source streamer stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_entry;
    use crate::entry::{Version, VersionedEntry};
    use crate::feed::MemoryFeed;
    use crate::metrics::{I2K_BYTES_SNT, I2K_EVTS_SNT_CNT};
    use crate::transport::{BoxFuture, InboundRecord, MemoryTransport, MetadataRecord};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn person(key: &str, cluster: u8, order: u64) -> VersionedEntry {
        VersionedEntry::put(key, json!({"name": key}), Some("Person".to_string()), Version::new(cluster, order))
    }

    fn streamer(feed: Arc<MemoryFeed>, transport: Arc<dyn Transport>) -> SourceStreamer {
        SourceStreamer::new(SourceConfig::for_testing("t"), 1, feed, transport).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_and_commits() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(MemoryTransport::new());
        for i in 0..5 {
            feed.append("people", person(&format!("k{}", i), 1, i + 1), true).await;
        }

        let source = streamer(Arc::clone(&feed), transport.clone());
        let result = source.process_once().await.unwrap();

        assert_eq!(result.read, 5);
        assert_eq!(result.sent, 5);
        assert_eq!(result.metadata_published, 1);
        assert_eq!(transport.topic_len("t").await, 5);
        assert_eq!(transport.metadata_len("t-meta").await, 1);
        assert_eq!(feed.pending().await, 0);

        let snapshot = source.metrics().snapshot();
        assert_eq!(snapshot.get(I2K_EVTS_SNT_CNT), Some(5));
        assert_eq!(snapshot.get(I2K_BYTES_SNT), Some(result.bytes as u64));

        assert!(source.process_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_land_on_key_partition() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(MemoryTransport::new());
        feed.append("people", person("alice", 1, 1), true).await;
        feed.append("people", person("alice", 1, 2), true).await;

        streamer(Arc::clone(&feed), transport.clone()).process_once().await.unwrap();

        let partition = partition_for_key("alice", 8);
        let records = transport.partition_records("t", partition).await;
        assert_eq!(records.len(), 2);
        assert_eq!(decode_entry(&records[1]).unwrap().version.order, 2);
    }

    #[tokio::test]
    async fn test_filters() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(MemoryTransport::new());

        let mut config = SourceConfig::for_testing("t");
        config.caches.insert("people".to_string());
        config.only_primary = true;
        let source = SourceStreamer::new(config, 1, feed.clone(), transport.clone()).unwrap();

        feed.append("people", person("a", 1, 1), true).await;
        feed.append("orders", person("b", 1, 2), true).await;
        feed.append("people", person("c", 1, 3), false).await;
        feed.append("people", person("d", 2, 9), true).await;

        let result = source.process_once().await.unwrap();
        assert_eq!(result.read, 4);
        assert_eq!(result.filtered, 3);
        assert_eq!(result.sent, 1);
        assert_eq!(feed.pending().await, 0, "filtered events are committed too");
    }

    #[tokio::test]
    async fn test_type_announced_once() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(MemoryTransport::new());
        let source = streamer(Arc::clone(&feed), transport.clone());

        feed.append("people", person("a", 1, 1), true).await;
        source.process_once().await.unwrap();
        feed.append("people", person("b", 1, 2), true).await;
        let second = source.process_once().await.unwrap();

        assert_eq!(second.metadata_published, 0);
        assert_eq!(transport.metadata_len("t-meta").await, 1);
    }

    #[tokio::test]
    async fn test_respects_batch_size() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(MemoryTransport::new());
        let mut config = SourceConfig::for_testing("t");
        config.max_batch_size = 3;
        let source = SourceStreamer::new(config, 1, feed.clone(), transport.clone()).unwrap();

        for i in 0..7 {
            feed.append("c", person(&format!("k{}", i), 1, i + 1), true).await;
        }

        assert_eq!(source.process_once().await.unwrap().read, 3);
        assert_eq!(source.process_once().await.unwrap().read, 3);
        assert_eq!(source.process_once().await.unwrap().read, 1);
        assert_eq!(transport.topic_len("t").await, 7);
    }

    /// Fails the first `failures` publishes, then forwards.
    struct FlakyTransport {
        inner: MemoryTransport,
        failures: AtomicUsize,
    }

    impl Transport for FlakyTransport {
        fn publish<'a>(&'a self, topic: &'a str, records: Vec<OutboundRecord>) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return Err(CdcError::transport_msg("publish", "broker unavailable"));
                }
                self.inner.publish(topic, records).await
            })
        }

        fn publish_metadata<'a>(&'a self, topic: &'a str, data: Vec<u8>) -> BoxFuture<'a, String> {
            self.inner.publish_metadata(topic, data)
        }

        fn poll<'a>(
            &'a self,
            topic: &'a str,
            cursors: &'a [(u32, String)],
            max: usize,
            timeout: Duration,
        ) -> BoxFuture<'a, Vec<InboundRecord>> {
            self.inner.poll(topic, cursors, max, timeout)
        }

        fn read_metadata<'a>(&'a self, topic: &'a str, after: &'a str) -> BoxFuture<'a, Vec<MetadataRecord>> {
            self.inner.read_metadata(topic, after)
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_retried_before_commit() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(FlakyTransport {
            inner: MemoryTransport::new(),
            failures: AtomicUsize::new(2),
        });
        feed.append("c", person("a", 1, 1), true).await;

        let source = streamer(Arc::clone(&feed), transport.clone());
        let result = source.process_once().await.unwrap();
        assert_eq!(result.sent, 1);
        assert_eq!(transport.inner.topic_len("t").await, 1);
        assert_eq!(feed.pending().await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_publish_leaves_feed_uncommitted() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(FlakyTransport {
            inner: MemoryTransport::new(),
            failures: AtomicUsize::new(100),
        });
        feed.append("c", person("a", 1, 1), true).await;

        let source = streamer(Arc::clone(&feed), transport);
        let err = source.process_once().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(feed.pending().await, 1);
        assert_eq!(feed.committed().await, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let feed = Arc::new(MemoryFeed::new());
        let transport = Arc::new(MemoryTransport::new());
        let source = Arc::new(streamer(Arc::clone(&feed), transport.clone()));
        let (tx, rx) = watch::channel(false);

        let runner = Arc::clone(&source);
        let handle = tokio::spawn(async move { runner.run(rx).await });

        feed.append("c", person("a", 1, 1), true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(transport.topic_len("t").await, 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = SourceConfig::for_testing("t");
        config.kafka_partitions = 0;
        let result = SourceStreamer::new(
            config,
            1,
            Arc::new(MemoryFeed::new()),
            Arc::new(MemoryTransport::new()),
        );
        assert!(matches!(result, Err(CdcError::Config(_))));

        let mut config = SourceConfig::for_testing("t");
        config.kafka_request_timeout = "ten seconds".to_string();
        let result = SourceStreamer::new(
            config,
            1,
            Arc::new(MemoryFeed::new()),
            Arc::new(MemoryTransport::new()),
        );
        assert!(matches!(result, Err(CdcError::Config(ref msg)) if msg.contains("ten seconds")));
    }
}
