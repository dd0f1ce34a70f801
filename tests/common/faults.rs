//! Store and transport wrappers that fail on demand.

use cdc_replication::codec::TypeDescriptor;
use cdc_replication::store::{BoxFuture as StoreFuture, StoreError};
use cdc_replication::transport::{BoxFuture, InboundRecord, MetadataRecord, OutboundRecord};
use cdc_replication::{CdcError, EntryStore, MemoryStore, MemoryTransport, Transport, VersionedEntry};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Take one unit from a failure budget, returning whether to fail.
fn take(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A [`MemoryStore`] whose writes fail while a failure budget lasts, or
/// always once [`FlakyStore::fail_always`] is set.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    write_failures: AtomicUsize,
    always: AtomicBool,
    pub write_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, always: bool) {
        self.always.store(always, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.always.load(Ordering::SeqCst) || take(&self.write_failures)
    }
}

impl EntryStore for FlakyStore {
    fn should_accept_writes(&self) -> bool {
        self.inner.should_accept_writes()
    }

    fn get<'a>(&'a self, cache: &'a str, key: &'a str) -> StoreFuture<'a, Option<VersionedEntry>> {
        self.inner.get(cache, key)
    }

    fn put<'a>(&'a self, cache: &'a str, entry: VersionedEntry) -> StoreFuture<'a, ()> {
        if self.should_fail() {
            return Box::pin(async { Err(StoreError("injected put failure".to_string())) });
        }
        self.inner.put(cache, entry)
    }

    fn remove<'a>(&'a self, cache: &'a str, entry: VersionedEntry) -> StoreFuture<'a, ()> {
        if self.should_fail() {
            return Box::pin(async { Err(StoreError("injected remove failure".to_string())) });
        }
        self.inner.remove(cache, entry)
    }

    fn register_type<'a>(&'a self, descriptor: &'a TypeDescriptor) -> StoreFuture<'a, ()> {
        self.inner.register_type(descriptor)
    }
}

/// A [`MemoryTransport`] that fails publishes and polls from a budget and
/// can corrupt records in flight.
#[derive(Default)]
pub struct FaultyTransport {
    pub inner: MemoryTransport,
    publish_failures: AtomicUsize,
    poll_failures: AtomicUsize,
    corrupt_next: AtomicUsize,
    pub polls: AtomicUsize,
}

impl FaultyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_publishes(&self, n: usize) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_polls(&self, n: usize) {
        self.poll_failures.store(n, Ordering::SeqCst);
    }

    /// Deliver the next `n` polled records as malformed wire entries.
    pub fn corrupt_next_records(&self, n: usize) {
        self.corrupt_next.store(n, Ordering::SeqCst);
    }
}

impl Transport for FaultyTransport {
    fn publish<'a>(&'a self, topic: &'a str, records: Vec<OutboundRecord>) -> BoxFuture<'a, ()> {
        if take(&self.publish_failures) {
            return Box::pin(async { Err(CdcError::transport_msg("publish", "injected failure")) });
        }
        self.inner.publish(topic, records)
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
        Box::pin(async move {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if take(&self.poll_failures) {
                return Err(CdcError::transport_msg("poll", "injected failure"));
            }
            let mut records = self.inner.poll(topic, cursors, max, timeout).await?;
            for inbound in records.iter_mut() {
                if take(&self.corrupt_next) {
                    inbound.record = Err(CdcError::Codec(format!(
                        "malformed entry at {}",
                        inbound.offset
                    )));
                }
            }
            Ok(records)
        })
    }

    fn read_metadata<'a>(&'a self, topic: &'a str, after: &'a str) -> BoxFuture<'a, Vec<MetadataRecord>> {
        self.inner.read_metadata(topic, after)
    }
}
