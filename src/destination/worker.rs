// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination worker: one task per slice of the partition range.
//!
//! Each worker owns its partitions exclusively for the lifetime of the
//! streamer, so every key it applies is written by no other worker.
//!
//! ```text
//! poll ─► refresh types ─► for each record:            ─► commit offsets
//!                            cache filter                   (one transaction,
//!                            decode (poisoned ⇒ skip)       max offset per
//!                            read stored version            partition)
//!                            resolve
//!                            apply winner
//! ```
//!
//! # Failure Handling
//!
//! - A record that cannot be decoded, or whose type was never announced, is
//!   logged and skipped. It never blocks the partition.
//! - A transient failure (store error, open circuit, transport error) retries
//!   the whole batch after a backoff. Nothing is committed until the batch
//!   succeeds; already-applied records resolve to no-ops on the retry.
//! - When a bounded retry policy runs out the worker returns the error and
//!   the batch stays uncommitted.
//!
//! # Shutdown
//!
//! The shutdown signal is observed between batches and while waiting
//! (poll, backoff). A batch being applied is finished and committed first.
//! A batch that is waiting out a retry backoff is abandoned uncommitted and
//! replayed by the next run.

use super::registry::TypeRegistry;
use crate::circuit_breaker::StoreCircuit;
use crate::codec::decode_entry;
use crate::config::DestinationConfig;
use crate::entry::VersionedEntry;
use crate::error::{CdcError, Result};
use crate::metrics::{self, StreamerMetrics};
use crate::offsets::OffsetStore;
use crate::resilience::{RateLimiter, RetryPolicy};
use crate::resolver::ConflictResolver;
use crate::store::EntryStore;
use crate::transport::{compare_offsets, offset_lag_ms, InboundRecord, Transport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    /// Shutdown observed; finishing the in-flight batch.
    Stopping,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Stopped => write!(f, "Stopped"),
            WorkerState::Running => write!(f, "Running"),
            WorkerState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// What happened to the records of one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    /// Incoming entry won and was written.
    pub applied: usize,
    /// Stored entry kept.
    pub skipped: usize,
    /// Cache not replicated to this destination.
    pub filtered: usize,
    pub poisoned: usize,
}

pub(crate) struct Worker<S: EntryStore + ?Sized> {
    pub index: usize,
    pub partitions: Vec<u32>,
    pub config: Arc<DestinationConfig>,
    pub resolver: Arc<ConflictResolver>,
    pub store: Arc<S>,
    pub transport: Arc<dyn Transport>,
    pub offsets: Arc<OffsetStore>,
    pub registry: Arc<TypeRegistry>,
    pub circuit: Arc<StoreCircuit>,
    pub metrics: Arc<StreamerMetrics>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub retry: RetryPolicy,
    pub state_tx: watch::Sender<WorkerState>,
}

/// Highest offset per partition in a polled batch.
fn batch_offsets(records: &[InboundRecord]) -> Vec<(u32, String)> {
    let mut latest: BTreeMap<u32, &str> = BTreeMap::new();
    for record in records {
        latest
            .entry(record.partition)
            .and_modify(|offset| {
                if compare_offsets(&record.offset, offset).is_gt() {
                    *offset = &record.offset;
                }
            })
            .or_insert(&record.offset);
    }
    latest.into_iter().map(|(p, o)| (p, o.to_string())).collect()
}

/// Sleep for `delay` unless shutdown arrives first. Returns `true` on shutdown.
async fn pause(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

impl<S: EntryStore + ?Sized> Worker<S> {
    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
        metrics::set_worker_state(&self.config.topic, self.index, &state.to_string());
    }

    /// Run until shutdown, or until a batch fails for good.
    pub(crate) async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("destination_worker", topic = %self.config.topic, worker = self.index);

        async move {
            self.set_state(WorkerState::Running);
            info!(partitions = ?self.partitions, "Starting destination worker");

            let result = self.poll_loop(&mut shutdown_rx).await;

            self.set_state(WorkerState::Stopping);
            self.set_state(WorkerState::Stopped);
            match &result {
                Ok(()) => info!("Destination worker stopped"),
                Err(e) => error!(error = %e, "Destination worker failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn poll_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let topic = self.config.topic.as_str();
        let group_id = self.config.group_id.as_str();
        let timeout = self.config.request_timeout()?;

        let mut cursors = self.offsets.load(group_id, topic, &self.partitions).await?;
        debug!(cursors = ?cursors, "Resuming from committed offsets");

        let mut poll_failures = 0usize;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if !self.store.should_accept_writes() {
                debug!("Store applying backpressure, pausing");
                if pause(shutdown_rx, timeout).await {
                    break;
                }
                continue;
            }

            let poll_start = Instant::now();
            let polled = tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }

                result = self.transport.poll(topic, &cursors, self.config.max_batch_size, timeout) => result,
            };
            metrics::record_poll_latency(topic, self.index, poll_start.elapsed());

            let records = match polled {
                Ok(records) => {
                    poll_failures = 0;
                    records
                }
                Err(e) if e.is_retryable() => {
                    poll_failures += 1;
                    if self.retry.is_exhausted(poll_failures) {
                        error!(attempts = poll_failures, error = %e, "Poll retries exhausted");
                        metrics::record_retries_exhausted("destination");
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(poll_failures);
                    warn!(
                        attempts = poll_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Poll failed, backing off"
                    );
                    metrics::record_retry("destination", e.kind());
                    if pause(shutdown_rx, delay).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if records.is_empty() {
                continue;
            }

            self.metrics.record_received(records.len() as u64);

            let Some(committed) = self.process_batch(&records, shutdown_rx).await? else {
                break;
            };

            for (partition, offset) in committed {
                if let Some(cursor) = cursors.iter_mut().find(|(p, _)| *p == partition) {
                    cursor.1 = offset;
                }
            }
        }

        Ok(())
    }

    /// Apply and commit one batch, retrying it whole on transient failure.
    ///
    /// Returns the committed offsets, or `None` if shutdown arrived while
    /// the batch was waiting to be retried.
    async fn process_batch(
        &self,
        records: &[InboundRecord],
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<(u32, String)>>> {
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            if *shutdown_rx.borrow() {
                self.set_state(WorkerState::Stopping);
            }

            let start = Instant::now();
            let error = match self.apply_and_commit(records).await {
                Ok((outcome, committed)) => {
                    metrics::record_apply_latency(&self.config.topic, records.len(), start.elapsed());
                    debug!(
                        received = outcome.received,
                        applied = outcome.applied,
                        skipped = outcome.skipped,
                        filtered = outcome.filtered,
                        poisoned = outcome.poisoned,
                        attempts,
                        "Batch committed"
                    );
                    return Ok(Some(committed));
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if self.retry.is_exhausted(attempts) {
                error!(
                    attempts,
                    records = records.len(),
                    error = %error,
                    "Batch retries exhausted; offsets left uncommitted"
                );
                metrics::record_retries_exhausted("destination");
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempts);
            warn!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Batch failed, retrying"
            );
            metrics::record_retry("destination", error.kind());

            if pause(shutdown_rx, delay).await {
                self.set_state(WorkerState::Stopping);
                warn!(records = records.len(), "Shutdown while retrying batch; left uncommitted for replay");
                return Ok(None);
            }
        }
    }

    async fn apply_and_commit(&self, records: &[InboundRecord]) -> Result<(BatchOutcome, Vec<(u32, String)>)> {
        let outcome = self.apply_batch(records).await?;

        let committed = batch_offsets(records);
        self.offsets
            .commit(&self.config.group_id, &self.config.topic, &committed)
            .await?;

        self.metrics.record_applied(records.len() as u64);

        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        for (partition, offset) in &committed {
            if let Some(lag) = offset_lag_ms(offset, now_ms) {
                metrics::record_consumer_lag_ms(&self.config.topic, *partition, lag);
            }
        }

        Ok((outcome, committed))
    }

    async fn apply_batch(&self, records: &[InboundRecord]) -> Result<BatchOutcome> {
        self.registry.refresh(&*self.transport, &*self.store).await?;

        let mut outcome = BatchOutcome {
            received: records.len(),
            ..Default::default()
        };

        for inbound in records {
            let encoded = match &inbound.record {
                Ok(encoded) => encoded,
                Err(e) => {
                    self.skip_poisoned(inbound, "wire", e);
                    outcome.poisoned += 1;
                    continue;
                }
            };

            let cache = encoded.cache.as_str();
            if !self.config.includes_cache(cache) {
                outcome.filtered += 1;
                continue;
            }

            let entry = match decode_entry(encoded) {
                Ok(entry) => entry,
                Err(e) => {
                    self.skip_poisoned(inbound, "codec", &e);
                    outcome.poisoned += 1;
                    continue;
                }
            };

            if let Some(type_name) = &entry.type_name {
                if !self.registry.contains(type_name).await {
                    self.skip_poisoned(inbound, "unknown_type", &CdcError::UnknownType(type_name.clone()));
                    outcome.poisoned += 1;
                    continue;
                }
            }

            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let current = self
                .circuit
                .get(&*self.store, cache, &entry.key)
                .await?
                .unwrap_or_else(|| VersionedEntry::start(entry.key.clone()));

            if self.resolver.resolve(&current, &entry).is_use_new() {
                trace!(
                    cache,
                    key = %entry.key,
                    version = %entry.version,
                    op = entry.operation(),
                    "Applying replicated entry"
                );
                self.circuit.apply(&*self.store, cache, entry).await?;
                outcome.applied += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        Ok(outcome)
    }

    fn skip_poisoned(&self, inbound: &InboundRecord, reason: &str, error: &CdcError) {
        warn!(
            partition = inbound.partition,
            offset = %inbound.offset,
            reason,
            error = %error,
            "Skipping poisoned record"
        );
        metrics::record_poisoned_record(&self.config.topic, reason);
    }
}
