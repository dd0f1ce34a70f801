//! In-process partitioned log.
//!
//! Offsets are `"{n}-0"` where `n` is the 1-based position in the partition,
//! so they compare the same way Redis stream ids do and `"0"` still means
//! "before the first record".

use super::{parse_offset, BoxFuture, InboundRecord, MetadataRecord, OutboundRecord, Transport};
use crate::codec::EncodedRecord;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct Log {
    partitions: HashMap<(String, u32), Vec<EncodedRecord>>,
    metadata: HashMap<String, Vec<Vec<u8>>>,
}

/// A [`Transport`] that keeps every topic in memory.
///
/// Shared between a source and a destination streamer it connects two
/// clusters in one process.
#[derive(Default)]
pub struct MemoryTransport {
    log: Mutex<Log>,
    appended: Notify,
}

fn offset_at(index: usize) -> String {
    format!("{}-0", index + 1)
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records stored in one partition.
    pub async fn partition_records(&self, topic: &str, partition: u32) -> Vec<EncodedRecord> {
        let log = self.log.lock().await;
        log.partitions
            .get(&(topic.to_string(), partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Total records across all partitions of a topic.
    pub async fn topic_len(&self, topic: &str) -> usize {
        let log = self.log.lock().await;
        log.partitions
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, records)| records.len())
            .sum()
    }

    pub async fn metadata_len(&self, topic: &str) -> usize {
        let log = self.log.lock().await;
        log.metadata.get(topic).map_or(0, Vec::len)
    }

    /// Take records round-robin across `cursors`, one per partition per
    /// round, so a backlog in one partition cannot starve the others.
    async fn read_after(&self, topic: &str, cursors: &[(u32, String)], max: usize) -> Vec<InboundRecord> {
        let log = self.log.lock().await;

        let mut pending: Vec<(u32, &[EncodedRecord], usize)> = cursors
            .iter()
            .filter_map(|(partition, cursor)| {
                let records = log.partitions.get(&(topic.to_string(), *partition))?;
                let start = parse_offset(cursor).0 as usize;
                (start < records.len()).then_some((*partition, records.as_slice(), start))
            })
            .collect();

        let mut out = Vec::new();
        while out.len() < max && !pending.is_empty() {
            for (partition, records, next) in pending.iter_mut() {
                if out.len() >= max {
                    break;
                }
                out.push(InboundRecord {
                    partition: *partition,
                    offset: offset_at(*next),
                    record: Ok(records[*next].clone()),
                });
                *next += 1;
            }
            pending.retain(|(_, records, next)| *next < records.len());
        }

        out
    }
}

impl Transport for MemoryTransport {
    fn publish<'a>(&'a self, topic: &'a str, records: Vec<OutboundRecord>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut log = self.log.lock().await;
                for out in records {
                    log.partitions
                        .entry((topic.to_string(), out.partition))
                        .or_default()
                        .push(out.record);
                }
            }
            self.appended.notify_waiters();
            Ok(())
        })
    }

    fn publish_metadata<'a>(&'a self, topic: &'a str, data: Vec<u8>) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut log = self.log.lock().await;
            let stream = log.metadata.entry(topic.to_string()).or_default();
            stream.push(data);
            Ok(offset_at(stream.len() - 1))
        })
    }

    fn poll<'a>(
        &'a self,
        topic: &'a str,
        cursors: &'a [(u32, String)],
        max: usize,
        timeout: Duration,
    ) -> BoxFuture<'a, Vec<InboundRecord>> {
        Box::pin(async move {
            // Register interest before reading so an append in between is not missed.
            let appended = self.appended.notified();

            let records = self.read_after(topic, cursors, max).await;
            if !records.is_empty() {
                return Ok(records);
            }

            if tokio::time::timeout(timeout, appended).await.is_err() {
                return Ok(Vec::new());
            }
            Ok(self.read_after(topic, cursors, max).await)
        })
    }

    fn read_metadata<'a>(&'a self, topic: &'a str, after: &'a str) -> BoxFuture<'a, Vec<MetadataRecord>> {
        Box::pin(async move {
            let log = self.log.lock().await;
            let start = parse_offset(after).0 as usize;
            Ok(log
                .metadata
                .get(topic)
                .map(|stream| {
                    stream
                        .iter()
                        .enumerate()
                        .skip(start)
                        .map(|(index, data)| MetadataRecord {
                            offset: offset_at(index),
                            data: data.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }
}
