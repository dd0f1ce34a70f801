//! One simulated cluster: a memory store whose writes are captured by a
//! change feed, plus the clock that stamps local versions.

use cdc_replication::{
    CdcConfig, DestinationStreamer, EntryStore, MemoryFeed, MemoryStore, OffsetStoreConfig, SourceStreamer,
    Transport, Version, VersionedEntry,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const CACHE: &str = "people";
pub const TYPE_NAME: &str = "Person";

pub struct TestCluster {
    pub id: u8,
    pub feed: Arc<MemoryFeed>,
    pub store: Arc<MemoryStore>,
    clock: AtomicU64,
}

impl TestCluster {
    pub fn new(id: u8) -> Self {
        let feed = Arc::new(MemoryFeed::new());
        let store = Arc::new(MemoryStore::with_feed(Arc::clone(&feed)));
        Self {
            id,
            feed,
            store,
            clock: AtomicU64::new(0),
        }
    }

    pub fn next_version(&self) -> Version {
        Version::new(self.id, self.clock.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Local write with the next version.
    pub async fn put(&self, key: &str, value: Value) -> Version {
        let version = self.next_version();
        self.put_at(key, value, version).await;
        version
    }

    /// Local write with an explicit version.
    pub async fn put_at(&self, key: &str, value: Value, version: Version) {
        let entry = VersionedEntry::put(key, value, Some(TYPE_NAME.to_string()), version);
        self.store.put(CACHE, entry).await.expect("memory put");
    }

    /// Local removal with the next version.
    pub async fn remove(&self, key: &str) -> Version {
        let version = self.next_version();
        self.store
            .remove(CACHE, VersionedEntry::tombstone(key, version))
            .await
            .expect("memory remove");
        version
    }

    pub async fn get(&self, key: &str) -> Option<VersionedEntry> {
        self.store.get(CACHE, key).await.expect("memory get")
    }

    pub async fn len(&self) -> usize {
        self.store.len(CACHE).await
    }

    /// Test config for this cluster sending on `send_topic`, receiving on `receive_topic`.
    pub fn config(&self, send_topic: &str, receive_topic: &str) -> CdcConfig {
        CdcConfig::for_testing(self.id, send_topic, receive_topic)
    }

    pub fn source(&self, config: &CdcConfig, transport: Arc<dyn Transport>) -> SourceStreamer {
        SourceStreamer::new(config.source.clone(), self.id, self.feed.clone(), transport).expect("source config")
    }

    pub fn destination(
        &self,
        config: &CdcConfig,
        transport: Arc<dyn Transport>,
        offsets: OffsetStoreConfig,
    ) -> DestinationStreamer<MemoryStore> {
        DestinationStreamer::new(
            config.destination.clone(),
            config.topology.build().expect("topology"),
            Arc::clone(&self.store),
            transport,
            offsets,
        )
        .expect("destination config")
    }
}

/// Run `process_once` until the feed has nothing left to send.
pub async fn pump(source: &SourceStreamer) -> usize {
    let mut sent = 0;
    loop {
        let result = source.process_once().await.expect("source batch");
        if result.is_empty() {
            return sent;
        }
        sent += result.sent;
    }
}
