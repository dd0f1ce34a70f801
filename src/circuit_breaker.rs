//! Circuit breaker around the local store.
//!
//! A destination worker that keeps writing to a struggling store only makes
//! it worse. Store calls go through a `recloser` breaker: after enough
//! consecutive failures calls are rejected without reaching the store until
//! the recovery timeout has passed.
//!
//! # States
//!
//! - **Closed**: calls pass through
//! - **Open**: calls are rejected immediately
//! - **HalfOpen**: a few probe calls decide whether to close again
//!
//! A rejection surfaces as a retryable [`CdcError::Store`], so the worker
//! backs off and retries the batch exactly as it would for a store error.
//!
//! ```rust,no_run
//! # use cdc_replication::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() {
//! let circuit = CircuitBreaker::new("store_writes", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => {}
//!     Err(CircuitError::Rejected) => { /* open, back off */ }
//!     Err(CircuitError::Inner(_e)) => { /* store error */ }
//! }
//! # }
//! ```

use crate::entry::VersionedEntry;
use crate::error::{CdcError, Result};
use crate::store::{EntryStore, StoreError};
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open and the call was not attempted.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Rejected => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the closed-state window of recent calls.
    pub window: usize,
    /// Failure ratio within the window that trips the breaker.
    pub error_rate: f32,
    /// Probe calls allowed while half-open.
    pub half_open_calls: usize,
    /// How long the breaker stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 10,
            error_rate: 0.5,
            half_open_calls: 2,
            recovery_timeout: Duration::from_secs(5),
        }
    }
}

impl CircuitConfig {
    /// Writes: trip on a smaller window, probe more before closing.
    #[must_use]
    pub fn writes() -> Self {
        Self {
            window: 6,
            error_rate: 0.5,
            half_open_calls: 3,
            recovery_timeout: Duration::from_secs(5),
        }
    }

    /// Short recovery, for tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            window: 2,
            error_rate: 0.5,
            half_open_calls: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_calls.max(1))
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_rejection(&self.name);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

fn store_error(operation: &str, err: CircuitError<StoreError>) -> CdcError {
    match err {
        CircuitError::Rejected => CdcError::Store(format!("{}: circuit open", operation)),
        CircuitError::Inner(e) => CdcError::Store(format!("{}: {}", operation, e)),
    }
}

/// Store access for destination workers, reads and writes on separate breakers.
pub struct StoreCircuit {
    pub writes: CircuitBreaker,
    pub reads: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuit {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::writes(), CircuitConfig::default())
    }

    pub fn with_configs(writes: CircuitConfig, reads: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("store_writes", writes),
            reads: CircuitBreaker::new("store_reads", reads),
        }
    }

    pub async fn get<S: EntryStore + ?Sized>(&self, store: &S, cache: &str, key: &str) -> Result<Option<VersionedEntry>> {
        self.reads
            .call(|| store.get(cache, key))
            .await
            .map_err(|e| store_error("get", e))
    }

    /// Apply an entry: tombstones become removes, values become puts.
    pub async fn apply<S: EntryStore + ?Sized>(&self, store: &S, cache: &str, entry: VersionedEntry) -> Result<()> {
        if entry.is_tombstone() {
            self.writes
                .call(|| store.remove(cache, entry))
                .await
                .map_err(|e| store_error("remove", e))
        } else {
            self.writes
                .call(|| store.put(cache, entry))
                .await
                .map_err(|e| store_error("put", e))
        }
    }

    pub fn any_rejecting(&self) -> bool {
        self.writes.rejections() > self.writes.successes() || self.reads.rejections() > self.reads.successes()
    }
}
