//! Redis Streams transport.
//!
//! Each partition of a data topic is its own stream, `{prefix}{topic}:{p}`,
//! so per-partition ordering is the stream's own ordering and offsets are
//! stream ids. A metadata topic is a single stream, `{prefix}{topic}`.
//!
//! Data entries carry four fields: `cache`, `key`, `data` (JSON body, maybe
//! zstd) and `hash` (SHA256 of the uncompressed body).
//!
//! # Connections
//!
//! `XREAD BLOCK` parks a connection for the whole block timeout, and a
//! multiplexed `ConnectionManager` queues every other command behind it. The
//! transport therefore keeps a small pool and hands them out round-robin, so
//! destination workers polling at the same time do not serialize.

use super::{BoxFuture, InboundRecord, MetadataRecord, OutboundRecord, Transport, OFFSET_START};
use crate::codec::EncodedRecord;
use crate::config::TransportConfig;
use crate::error::{CdcError, Result};
use crate::resilience::RetryPolicy;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, trace, warn};

/// Redis Streams backed [`Transport`].
pub struct RedisTransport {
    config: TransportConfig,
    pool: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl RedisTransport {
    /// Connect the whole pool, retrying each connection per `retry`.
    pub async fn connect(config: TransportConfig, retry: &RetryPolicy) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| CdcError::Config(format!("Invalid Redis URL '{}': {}", config.redis_url, e)))?;

        let size = config.pool_size.max(1);
        config.validate()?;
        let connect_timeout = config.connect_timeout_duration()?;
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            pool.push(connect_one(&client, &config.redis_url, retry, connect_timeout).await?);
        }

        info!(url = %config.redis_url, pool_size = size, "Connected to Redis transport");

        Ok(Self {
            config,
            pool,
            next: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn conn(&self) -> ConnectionManager {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[i].clone()
    }
}

async fn connect_one(
    client: &Client,
    url: &str,
    retry: &RetryPolicy,
    connect_timeout: Duration,
) -> Result<ConnectionManager> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        // Wrap connection attempt in a timeout to avoid hanging on unreachable hosts
        let message = match timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    info!(url = %url, attempt, "Connected to Redis after retry");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", connect_timeout.as_millis()),
        };

        if retry.is_exhausted(attempt) {
            error!(url = %url, attempt, error = %message, "Failed to connect after max retries");
            return Err(CdcError::transport_msg(
                "connect",
                format!("Connection failed after {} attempts: {}", attempt, message),
            ));
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(
            url = %url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

impl Transport for RedisTransport {
    fn publish<'a>(&'a self, topic: &'a str, records: Vec<OutboundRecord>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(());
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for out in &records {
                pipe.cmd("XADD")
                    .arg(self.config.partition_key(topic, out.partition))
                    .arg("*")
                    .arg("cache")
                    .arg(&out.record.cache)
                    .arg("key")
                    .arg(&out.record.key)
                    .arg("data")
                    .arg(out.record.data.as_slice())
                    .arg("hash")
                    .arg(&out.record.hash)
                    .ignore();
            }

            let mut conn = self.conn();
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| CdcError::transport("XADD", e))?;

            trace!(topic = %topic, count = records.len(), "Published records");
            Ok(())
        })
    }

    fn publish_metadata<'a>(&'a self, topic: &'a str, data: Vec<u8>) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut conn = self.conn();
            let id: String = redis::cmd("XADD")
                .arg(self.config.metadata_key(topic))
                .arg("*")
                .arg("data")
                .arg(data.as_slice())
                .query_async(&mut conn)
                .await
                .map_err(|e| CdcError::transport("XADD", e))?;
            Ok(id)
        })
    }

    fn poll<'a>(
        &'a self,
        topic: &'a str,
        cursors: &'a [(u32, String)],
        max: usize,
        block: Duration,
    ) -> BoxFuture<'a, Vec<InboundRecord>> {
        Box::pin(async move {
            if cursors.is_empty() || max == 0 {
                return Ok(Vec::new());
            }

            let mut partitions = HashMap::with_capacity(cursors.len());
            let mut keys = Vec::with_capacity(cursors.len());
            let mut ids = Vec::with_capacity(cursors.len());
            for (partition, offset) in cursors {
                let key = self.config.partition_key(topic, *partition);
                partitions.insert(key.clone(), *partition);
                keys.push(key);
                ids.push(offset.as_str());
            }

            // COUNT applies per stream; split the budget so one poll stays near `max`.
            let per_stream = max.div_ceil(cursors.len()).max(1);
            let opts = StreamReadOptions::default()
                .block(block.as_millis().max(1) as usize)
                .count(per_stream);

            let mut conn = self.conn();
            let reply: StreamReadReply = conn
                .xread_options(&keys, &ids, &opts)
                .await
                .map_err(|e| CdcError::transport("XREAD", e))?;

            let mut records = Vec::new();
            for stream in reply.keys {
                let Some(&partition) = partitions.get(&stream.key) else {
                    warn!(stream = %stream.key, "XREAD returned an unrequested stream");
                    continue;
                };
                for entry in stream.ids {
                    records.push(InboundRecord {
                        partition,
                        record: parse_record(&entry.map),
                        offset: entry.id,
                    });
                }
            }

            Ok(records)
        })
    }

    fn read_metadata<'a>(&'a self, topic: &'a str, after: &'a str) -> BoxFuture<'a, Vec<MetadataRecord>> {
        Box::pin(async move {
            // XRANGE start is inclusive; "(" makes it exclusive (Redis 6.2+).
            let start = if after == OFFSET_START {
                "-".to_string()
            } else {
                format!("({}", after)
            };

            let mut conn = self.conn();
            let entries: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
                .arg(self.config.metadata_key(topic))
                .arg(&start)
                .arg("+")
                .query_async(&mut conn)
                .await
                .map_err(|e| CdcError::transport("XRANGE", e))?;

            let mut records = Vec::with_capacity(entries.len());
            for (offset, fields) in entries {
                match get_bytes_field(&fields, "data") {
                    Ok(data) => records.push(MetadataRecord { offset, data }),
                    Err(e) => warn!(offset = %offset, error = %e, "Skipping malformed metadata entry"),
                }
            }
            Ok(records)
        })
    }
}

fn parse_record(fields: &HashMap<String, redis::Value>) -> Result<EncodedRecord> {
    Ok(EncodedRecord {
        cache: get_string_field(fields, "cache")?,
        key: get_string_field(fields, "key")?,
        data: get_bytes_field(fields, "data")?,
        hash: get_string_field(fields, "hash")?,
    })
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| CdcError::Codec(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| CdcError::Codec(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(CdcError::Codec(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| CdcError::Codec(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(CdcError::Codec(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}
