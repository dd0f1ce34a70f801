//! Local change feed consumed by the source streamer.
//!
//! A feed hands out change events from its last committed position. Reading
//! does not advance the position; only [`ChangeFeed::commit`] does, after the
//! batch has been published. A crash between the two replays the batch,
//! which the destination absorbs through conflict resolution.

use crate::entry::VersionedEntry;
use crate::store::BoxFuture;
use tokio::sync::Mutex;

/// One captured change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub cache: String,
    pub entry: VersionedEntry,
    /// Observed on the primary copy of the key.
    pub primary: bool,
    /// Position in the feed, strictly increasing.
    pub position: u64,
}

impl ChangeEvent {
    pub fn type_name(&self) -> Option<&str> {
        self.entry.type_name.as_deref()
    }
}

/// Source of local changes.
pub trait ChangeFeed: Send + Sync + 'static {
    /// Up to `max` events after the last committed position, in order.
    fn next_batch(&self, max: usize) -> BoxFuture<'_, Vec<ChangeEvent>>;

    /// Mark everything up to and including `position` as consumed.
    fn commit(&self, position: u64) -> BoxFuture<'_, ()>;
}

#[derive(Default)]
struct FeedState {
    events: Vec<ChangeEvent>,
    committed: u64,
    next_position: u64,
}

/// In-process [`ChangeFeed`].
///
/// Committed events are dropped; the feed outlives any source streamer
/// reading it, so a restarted streamer resumes at the checkpoint.
#[derive(Default)]
pub struct MemoryFeed {
    state: Mutex<FeedState>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a change, returning its position.
    pub async fn append(&self, cache: &str, entry: VersionedEntry, primary: bool) -> u64 {
        let mut state = self.state.lock().await;
        state.next_position += 1;
        let position = state.next_position;
        state.events.push(ChangeEvent {
            cache: cache.to_string(),
            entry,
            primary,
            position,
        });
        position
    }

    pub async fn committed(&self) -> u64 {
        self.state.lock().await.committed
    }

    /// Events captured but not yet committed.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

impl ChangeFeed for MemoryFeed {
    fn next_batch(&self, max: usize) -> BoxFuture<'_, Vec<ChangeEvent>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.events.iter().take(max).cloned().collect())
        })
    }

    fn commit(&self, position: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if position <= state.committed {
                return Ok(());
            }
            state.committed = position;
            state.events.retain(|e| e.position > position);
            Ok(())
        })
    }
}
