// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partitioned log abstraction.
//!
//! The streamers only need four things from the log: append records to a
//! partition, append a metadata record, read records after a per-partition
//! offset, and read metadata after an offset. [`RedisTransport`] implements
//! this over Redis Streams (one stream per partition), [`MemoryTransport`]
//! keeps everything in process for tests and embedded use.
//!
//! # Offsets
//!
//! Offsets are opaque strings in stream-id format, `{major}-{minor}`, and are
//! compared numerically with [`compare_offsets`]. The special offset `"0"`
//! means "before the first record".

mod memory;
mod streams;

pub use memory::MemoryTransport;
pub use streams::RedisTransport;

use crate::codec::EncodedRecord;
use crate::error::Result;
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed transport futures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Offset that precedes every record.
pub const OFFSET_START: &str = "0";

/// A record to append to one partition.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub partition: u32,
    pub record: EncodedRecord,
}

/// A record read from one partition.
///
/// `record` is an error when the wire entry itself was malformed. The offset
/// is still valid so the consumer can skip past it.
#[derive(Debug)]
pub struct InboundRecord {
    pub partition: u32,
    pub offset: String,
    pub record: Result<EncodedRecord>,
}

/// A record read from the metadata topic.
#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub offset: String,
    pub data: Vec<u8>,
}

/// The partitioned log both streamers talk to.
pub trait Transport: Send + Sync + 'static {
    /// Append records to their partitions of `topic`.
    ///
    /// Returns once every record is durably acknowledged. On error the caller
    /// must assume any subset was written and resend the whole batch.
    fn publish<'a>(&'a self, topic: &'a str, records: Vec<OutboundRecord>) -> BoxFuture<'a, ()>;

    /// Append one record to the metadata topic, returning its offset.
    fn publish_metadata<'a>(&'a self, topic: &'a str, data: Vec<u8>) -> BoxFuture<'a, String>;

    /// Read up to `max` records after the given per-partition offsets.
    ///
    /// Waits at most `timeout` for data; an empty result means nothing new.
    /// Records of one partition are returned in offset order.
    fn poll<'a>(
        &'a self,
        topic: &'a str,
        cursors: &'a [(u32, String)],
        max: usize,
        timeout: Duration,
    ) -> BoxFuture<'a, Vec<InboundRecord>>;

    /// Read every metadata record after `after`, without waiting.
    fn read_metadata<'a>(&'a self, topic: &'a str, after: &'a str) -> BoxFuture<'a, Vec<MetadataRecord>>;
}

/// Compare two offsets numerically.
///
/// Offsets are formatted as `{major}-{minor}` (e.g., "1234567890123-0").
/// Malformed parts compare as zero, which places them at the start.
pub fn compare_offsets(a: &str, b: &str) -> Ordering {
    let (a_major, a_minor) = parse_offset(a);
    let (b_major, b_minor) = parse_offset(b);

    match a_major.cmp(&b_major) {
        Ordering::Equal => a_minor.cmp(&b_minor),
        other => other,
    }
}

/// Split an offset into its numeric parts.
pub(crate) fn parse_offset(offset: &str) -> (u64, u64) {
    match offset.split_once('-') {
        Some((major, minor)) => (major.parse().unwrap_or(0), minor.parse().unwrap_or(0)),
        None => (offset.parse().unwrap_or(0), 0),
    }
}

/// Milliseconds-since-epoch component of a Redis stream offset.
///
/// Returns `None` for `"0"` and malformed offsets.
pub fn parse_offset_timestamp(offset: &str) -> Option<u64> {
    let (major, _) = offset.split_once('-')?;
    major.parse().ok()
}

/// Time lag in milliseconds between an offset and `now_ms`.
pub fn offset_lag_ms(offset: &str, now_ms: u64) -> Option<u64> {
    parse_offset_timestamp(offset).map(|ts| now_ms.saturating_sub(ts))
}
