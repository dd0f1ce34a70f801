// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store integration traits.
//!
//! The destination streamer reads the current version of a key, resolves the
//! conflict, and writes the winner through [`EntryStore`]. The embedding
//! application implements the trait over its own storage; [`MemoryStore`]
//! is a complete in-process implementation.
//!
//! # Example
//!
//! ```rust,no_run
//! use cdc_replication::store::{BoxFuture, EntryStore};
//! use cdc_replication::entry::VersionedEntry;
//!
//! struct MyBackend { /* ... */ }
//!
//! impl EntryStore for MyBackend {
//!     fn get<'a>(&'a self, _cache: &'a str, _key: &'a str) -> BoxFuture<'a, Option<VersionedEntry>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn put<'a>(&'a self, _cache: &'a str, _entry: VersionedEntry) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn remove<'a>(&'a self, _cache: &'a str, _entry: VersionedEntry) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::codec::TypeDescriptor;
use crate::entry::VersionedEntry;
use crate::feed::MemoryFeed;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for store operations.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// What the destination needs from the local store.
///
/// Removals are written as tombstones carrying the removing version, so a
/// later replicated write for the same key still has something to be
/// resolved against.
pub trait EntryStore: Send + Sync + 'static {
    /// Check if the store is accepting writes (backpressure check).
    ///
    /// Workers pause between batches while this returns `false`.
    fn should_accept_writes(&self) -> bool {
        true
    }

    /// Current entry for a key, including a tombstone. `None` if never seen.
    fn get<'a>(&'a self, cache: &'a str, key: &'a str) -> BoxFuture<'a, Option<VersionedEntry>>;

    /// Write an entry, keeping its version and expiry.
    fn put<'a>(&'a self, cache: &'a str, entry: VersionedEntry) -> BoxFuture<'a, ()>;

    /// Remove a key, recording `entry` (a tombstone) as its last version.
    fn remove<'a>(&'a self, cache: &'a str, entry: VersionedEntry) -> BoxFuture<'a, ()>;

    /// Make a replicated type known to the store before entries of it arrive.
    fn register_type<'a>(&'a self, _descriptor: &'a TypeDescriptor) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// In-process [`EntryStore`].
///
/// When linked to a [`MemoryFeed`] every write is also emitted as a change
/// event, the way a real cluster's change capture would observe it.
#[derive(Default)]
pub struct MemoryStore {
    caches: RwLock<HashMap<String, HashMap<String, VersionedEntry>>>,
    types: RwLock<HashMap<u32, TypeDescriptor>>,
    feed: Option<Arc<MemoryFeed>>,
    paused: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes are captured into `feed`.
    pub fn with_feed(feed: Arc<MemoryFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Live (non-tombstone) entries in a cache.
    pub async fn len(&self, cache: &str) -> usize {
        let caches = self.caches.read().await;
        caches
            .get(cache)
            .map_or(0, |entries| entries.values().filter(|e| !e.is_tombstone()).count())
    }

    pub async fn is_empty(&self, cache: &str) -> bool {
        self.len(cache).await == 0
    }

    /// Live value of a key.
    pub async fn value(&self, cache: &str, key: &str) -> Option<serde_json::Value> {
        let caches = self.caches.read().await;
        caches.get(cache)?.get(key)?.value.clone()
    }

    /// Types registered so far.
    pub async fn registered_types(&self) -> Vec<TypeDescriptor> {
        self.types.read().await.values().cloned().collect()
    }

    /// Simulate backpressure.
    pub fn set_accepting_writes(&self, accepting: bool) {
        self.paused.store(!accepting, Ordering::Release);
    }

    async fn write(&self, cache: &str, entry: VersionedEntry) {
        {
            let mut caches = self.caches.write().await;
            caches
                .entry(cache.to_string())
                .or_default()
                .insert(entry.key.clone(), entry.clone());
        }
        if let Some(feed) = &self.feed {
            feed.append(cache, entry, true).await;
        }
    }
}

impl EntryStore for MemoryStore {
    fn should_accept_writes(&self) -> bool {
        !self.paused.load(Ordering::Acquire)
    }

    fn get<'a>(&'a self, cache: &'a str, key: &'a str) -> BoxFuture<'a, Option<VersionedEntry>> {
        Box::pin(async move {
            let caches = self.caches.read().await;
            Ok(caches.get(cache).and_then(|entries| entries.get(key)).cloned())
        })
    }

    fn put<'a>(&'a self, cache: &'a str, entry: VersionedEntry) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if entry.is_tombstone() {
                return Err(StoreError(format!("put of key '{}' carries no value", entry.key)));
            }
            self.write(cache, entry).await;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, cache: &'a str, entry: VersionedEntry) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !entry.is_tombstone() {
                return Err(StoreError(format!("remove of key '{}' carries a value", entry.key)));
            }
            self.write(cache, entry).await;
            Ok(())
        })
    }

    fn register_type<'a>(&'a self, descriptor: &'a TypeDescriptor) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.types
                .write()
                .await
                .insert(descriptor.type_id, descriptor.clone());
            Ok(())
        })
    }
}
