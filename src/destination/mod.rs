// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination streamer: transport → conflict resolution → local store.
//!
//! The streamer owns the partition range `[kafka_parts_from, kafka_parts_to)`
//! of its data topic. At start the range is sliced into `thread_count`
//! contiguous, disjoint slices, one per worker; assignments never change
//! while the streamer runs.
//!
//! # State Transitions
//!
//! ```text
//!             start()                  shutdown()
//! Created ─────────────► Running ─────────────────► ShuttingDown ──► Stopped
//!    │                      │                                          ▲
//!    │ shutdown()           │ worker fails for good                    │
//!    └──────────────────────┼──────────────────────────────────────────┘
//!                           ▼
//!                        Failed
//! ```
//!
//! A worker that exhausts a bounded retry policy moves the streamer to
//! `Failed` and signals the remaining workers to stop.

mod registry;
mod worker;

pub use registry::TypeRegistry;
pub use worker::{BatchOutcome, WorkerState};

use crate::circuit_breaker::StoreCircuit;
use crate::config::{DestinationConfig, OffsetStoreConfig};
use crate::error::{CdcError, Result};
use crate::metrics::{self, StreamerMetrics};
use crate::offsets::OffsetStore;
use crate::resilience::RateLimiter;
use crate::resolver::{ConflictResolver, ReplicationTopology};
use crate::store::EntryStore;
use crate::transport::Transport;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker::Worker;

/// Lifecycle of a destination streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Created,
    Running,
    /// Workers are finishing their in-flight batches.
    ShuttingDown,
    Stopped,
    /// A worker gave up on a batch. Offsets of that batch are uncommitted.
    Failed,
}

impl std::fmt::Display for StreamerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamerState::Created => write!(f, "Created"),
            StreamerState::Running => write!(f, "Running"),
            StreamerState::ShuttingDown => write!(f, "ShuttingDown"),
            StreamerState::Stopped => write!(f, "Stopped"),
            StreamerState::Failed => write!(f, "Failed"),
        }
    }
}

struct WorkerHandle {
    partitions: Vec<u32>,
    state_rx: watch::Receiver<WorkerState>,
    handle: JoinHandle<()>,
}

/// Applies replicated changes from one data topic to the local store.
pub struct DestinationStreamer<S: EntryStore + ?Sized> {
    config: Arc<DestinationConfig>,
    offsets_config: OffsetStoreConfig,
    resolver: Arc<ConflictResolver>,
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    registry: Arc<TypeRegistry>,
    circuit: Arc<StoreCircuit>,
    metrics: Arc<StreamerMetrics>,
    offsets: Option<Arc<OffsetStore>>,
    drain_timeout: Duration,
    state_tx: Arc<watch::Sender<StreamerState>>,
    state_rx: watch::Receiver<StreamerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    workers: Vec<WorkerHandle>,
}

impl<S: EntryStore + ?Sized> DestinationStreamer<S> {
    /// Create a streamer in `Created` state. Fails on invalid configuration.
    pub fn new(
        config: DestinationConfig,
        topology: ReplicationTopology,
        store: Arc<S>,
        transport: Arc<dyn Transport>,
        offsets_config: OffsetStoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let drain_timeout = config.drain_timeout_duration()?;

        let (state_tx, state_rx) = watch::channel(StreamerState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        let conflict_field = topology
            .conflict_field
            .as_ref()
            .and_then(|f| f.root_field())
            .map(str::to_string);
        let registry = Arc::new(TypeRegistry::new(config.metadata_topic.clone(), conflict_field));
        let metrics = Arc::new(StreamerMetrics::destination(&config.topic));

        Ok(Self {
            config: Arc::new(config),
            offsets_config,
            resolver: Arc::new(ConflictResolver::new(topology)),
            store,
            transport,
            registry,
            circuit: Arc::new(StoreCircuit::new()),
            metrics,
            offsets: None,
            drain_timeout,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            workers: Vec::new(),
        })
    }

    /// Replace the store circuit breakers.
    pub fn with_circuit(mut self, circuit: StoreCircuit) -> Self {
        self.circuit = Arc::new(circuit);
        self
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn state(&self) -> StreamerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<StreamerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamerState::Running
    }

    /// Counters for this streamer (`K2I_*`).
    pub fn metrics(&self) -> Arc<StreamerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn circuit(&self) -> &Arc<StoreCircuit> {
        &self.circuit
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Partitions owned by each worker, in worker order.
    pub fn assignments(&self) -> Vec<Vec<u32>> {
        self.workers.iter().map(|w| w.partitions.clone()).collect()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| *w.state_rx.borrow()).collect()
    }

    fn set_state(&self, state: StreamerState) {
        self.state_tx.send_replace(state);
        metrics::set_streamer_state(&self.config.topic, &state.to_string());
    }

    /// Open the offset store and spawn one worker per partition slice.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != StreamerState::Created {
            return Err(CdcError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let range = self.config.partition_range()?;
        let slices = range.split(self.config.thread_count)?;
        let retry = self.config.retry.to_policy()?;

        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            from = range.from,
            to = range.to,
            workers = slices.len(),
            "Starting destination streamer"
        );

        let offsets = match OffsetStore::open(&self.offsets_config).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open offset store");
                self.set_state(StreamerState::Failed);
                return Err(e);
            }
        };
        self.offsets = Some(Arc::clone(&offsets));

        let rate_limiter = self.config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for store writes"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        for (index, partitions) in slices.into_iter().enumerate() {
            let (worker_state_tx, worker_state_rx) = watch::channel(WorkerState::Stopped);
            let worker = Worker {
                index,
                partitions: partitions.clone(),
                config: Arc::clone(&self.config),
                resolver: Arc::clone(&self.resolver),
                store: Arc::clone(&self.store),
                transport: Arc::clone(&self.transport),
                offsets: Arc::clone(&offsets),
                registry: Arc::clone(&self.registry),
                circuit: Arc::clone(&self.circuit),
                metrics: Arc::clone(&self.metrics),
                rate_limiter: rate_limiter.clone(),
                retry: retry.clone(),
                state_tx: worker_state_tx,
            };

            let shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown_tx = Arc::clone(&self.shutdown_tx);
            let state_tx = Arc::clone(&self.state_tx);
            let topic = self.config.topic.clone();

            let handle = tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown_rx).await {
                    error!(worker = index, error = %e, "Worker failed, stopping destination streamer");
                    state_tx.send_replace(StreamerState::Failed);
                    metrics::set_streamer_state(&topic, "Failed");
                    shutdown_tx.send_replace(true);
                }
            });

            debug!(worker = index, partitions = ?partitions, "Spawned destination worker");
            self.workers.push(WorkerHandle {
                partitions,
                state_rx: worker_state_rx,
                handle,
            });
        }

        // A worker may already have failed.
        if self.state() == StreamerState::Created {
            self.set_state(StreamerState::Running);
        }
        info!(workers = self.workers.len(), "Destination streamer running");
        Ok(())
    }

    /// Stop all workers, waiting up to `drain_timeout` for each to finish
    /// its in-flight batch, then close the offset store.
    pub async fn shutdown(&mut self) {
        let failed = self.state() == StreamerState::Failed;
        info!(topic = %self.config.topic, "Shutting down destination streamer");
        if !failed {
            self.set_state(StreamerState::ShuttingDown);
        }

        self.shutdown_tx.send_replace(true);

        // Workers drain concurrently, each bounded by the drain timeout.
        let drain_timeout = self.drain_timeout;
        let drains = std::mem::take(&mut self.workers)
            .into_iter()
            .enumerate()
            .map(|(index, worker)| async move {
                let mut handle = worker.handle;
                match tokio::time::timeout(drain_timeout, &mut handle).await {
                    Ok(Ok(())) => debug!(worker = index, "Worker drained"),
                    Ok(Err(e)) => warn!(worker = index, error = %e, "Worker panicked during shutdown"),
                    Err(_) => {
                        warn!(worker = index, "Worker did not drain in time; its batch will be replayed");
                        handle.abort();
                    }
                }
            });
        join_all(drains).await;

        if let Some(offsets) = self.offsets.take() {
            offsets.close().await;
        }

        // A failure observed while draining still wins.
        if failed || self.state() == StreamerState::Failed {
            self.set_state(StreamerState::Failed);
            info!("Destination streamer stopped after failure");
        } else {
            self.set_state(StreamerState::Stopped);
            info!("Destination streamer stopped");
        }
    }
}
