//! # CDC Replication
//!
//! Cross-cluster change-data-capture replication over a partitioned log.
//!
//! Every participating cluster runs a [`SourceStreamer`] that publishes its
//! local changes, and a [`DestinationStreamer`] that applies the changes of
//! its peers. Concurrent writes to the same key are settled by a
//! deterministic [`ConflictResolver`], so delivery only has to be
//! at-least-once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────── cluster A ────────────────┐        ┌──────────────── cluster B ────────────────┐
//! │                                           │        │                                           │
//! │  ChangeFeed ─► SourceStreamer ─► publish ─┼──────► │ ─► poll ─► worker 0..n ─► ConflictResolver │
//! │                 (filter, batch,           │  log   │            (partition      │               │
//! │                  metadata, partition)     │ topic  │             slice)         ▼               │
//! │                                           │        │                        EntryStore           │
//! └───────────────────────────────────────────┘        └───────────────────────────────────────────┘
//! ```
//!
//! A key always hashes to the same partition, whichever cluster wrote it,
//! and each partition is owned by exactly one destination worker. Per-key
//! order is therefore preserved without coordination between workers.
//!
//! ## Modules
//!
//! - [`resolver`]: the five-rule conflict resolution
//! - [`source`], [`destination`]: the two streamers
//! - [`transport`]: the partitioned log (Redis Streams, or in memory)
//! - [`store`], [`feed`]: boundaries to the local storage engine
//! - [`offsets`]: committed consumer offsets (SQLite)
//! - [`codec`], [`partition`]: wire format and key routing
//! - [`metrics`]: `I2K_*`/`K2I_*` counters and the `metrics` facade
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cdc_replication::{
//!     CdcConfig, DestinationStreamer, MemoryFeed, MemoryStore, MemoryTransport, SourceStreamer,
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> cdc_replication::Result<()> {
//!     let config = CdcConfig::for_testing(1, "a-to-b", "b-to-a");
//!     let transport = Arc::new(MemoryTransport::new());
//!     let feed = Arc::new(MemoryFeed::new());
//!     let store = Arc::new(MemoryStore::with_feed(Arc::clone(&feed)));
//!
//!     let source = SourceStreamer::new(config.source.clone(), 1, feed, transport.clone())?;
//!     let mut destination = DestinationStreamer::new(
//!         config.destination.clone(),
//!         config.topology.build()?,
//!         store,
//!         transport,
//!         config.offsets.clone(),
//!     )?;
//!
//!     let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!     destination.start().await?;
//!     let handle = tokio::spawn(async move { source.run(shutdown_rx).await });
//!
//!     // ... until the process is asked to stop
//!     shutdown_tx.send(true).ok();
//!     handle.await.ok();
//!     destination.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod destination;
pub mod entry;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod offsets;
pub mod partition;
pub mod resilience;
pub mod resolver;
pub mod source;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use config::{CdcConfig, DestinationConfig, OffsetStoreConfig, SourceConfig, TopologyConfig, TransportConfig};
pub use destination::{DestinationStreamer, StreamerState, WorkerState};
pub use entry::{Version, VersionedEntry};
pub use error::{CdcError, Result};
pub use feed::{ChangeEvent, ChangeFeed, MemoryFeed};
pub use metrics::{MetricsSnapshot, StreamerMetrics};
pub use offsets::OffsetStore;
pub use resolver::{ConflictField, ConflictResolver, Decision, ReplicationTopology};
pub use source::{SourceBatchResult, SourceStreamer};
pub use store::{EntryStore, MemoryStore, StoreError};
pub use transport::{MemoryTransport, RedisTransport, Transport};
