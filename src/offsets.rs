// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Committed consumer offsets.
//!
//! Stores, per consumer group, topic and partition, the offset of the last
//! record whose batch was fully applied to the local store. A restarted
//! destination resumes strictly after it.
//!
//! ## Offset Semantics
//!
//! ```text
//! poll batch → resolve + apply every record → commit max offset per partition
//!              (crash here = re-poll the batch, resolution makes it a no-op)
//! ```
//!
//! All offsets of one batch are written in a single transaction, so a crash
//! never leaves some partitions of a batch committed and others not.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff; every
//! worker of a destination shares this store.

use crate::config::OffsetStoreConfig;
use crate::error::{CdcError, Result};
use crate::transport::OFFSET_START;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::offset_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent offset storage backed by SQLite.
pub struct OffsetStore {
    pool: SqlitePool,
    path: String,
    wal_mode: bool,
}

impl OffsetStore {
    /// Open the store described by `config`, creating the schema if needed.
    pub async fn open(config: &OffsetStoreConfig) -> Result<Self> {
        if config.is_in_memory() {
            return Self::in_memory().await;
        }

        info!(path = %config.sqlite_path, "Initializing offset store");

        let journal = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
            .map_err(|e| CdcError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::init(pool, config.sqlite_path.clone(), config.wal_mode).await
    }

    /// A private in-memory database, lost on close.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CdcError::Config(format!("Invalid SQLite path: {}", e)))?;

        // Each connection to :memory: is its own database; pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string(), false).await
    }

    async fn init(pool: SqlitePool, path: String, wal_mode: bool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS committed_offsets (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                stream_offset TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path, wal_mode })
    }

    /// Committed offsets for `partitions`, `"0"` where nothing was committed.
    pub async fn load(&self, group_id: &str, topic: &str, partitions: &[u32]) -> Result<Vec<(u32, String)>> {
        let pool = &self.pool;
        let rows: Vec<(i64, String)> = execute_with_retry("offset_load", || async move {
            sqlx::query_as("SELECT partition_id, stream_offset FROM committed_offsets WHERE group_id = ? AND topic = ?")
                .bind(group_id)
                .bind(topic)
                .fetch_all(pool)
                .await
        })
        .await?;

        let committed: HashMap<u32, String> = rows
            .into_iter()
            .filter_map(|(p, offset)| u32::try_from(p).ok().map(|p| (p, offset)))
            .collect();

        let offsets: Vec<(u32, String)> = partitions
            .iter()
            .map(|p| {
                let offset = committed.get(p).cloned().unwrap_or_else(|| OFFSET_START.to_string());
                (*p, offset)
            })
            .collect();

        let restored = offsets.iter().filter(|(_, o)| o != OFFSET_START).count();
        if restored > 0 {
            info!(group_id, topic, restored, "Restored committed offsets");
        }

        Ok(offsets)
    }

    /// Commit the offsets of one applied batch atomically.
    pub async fn commit(&self, group_id: &str, topic: &str, offsets: &[(u32, String)]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("offset_commit", || async move {
            let mut tx = pool.begin().await?;
            for (partition, offset) in offsets {
                sqlx::query(
                    r#"
                    INSERT INTO committed_offsets (group_id, topic, partition_id, stream_offset, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                        stream_offset = excluded.stream_offset,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(group_id)
                .bind(topic)
                .bind(i64::from(*partition))
                .bind(offset)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;

        debug!(group_id, topic, partitions = offsets.len(), "Committed offsets");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("offset_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn close(&self) {
        if self.wal_mode {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!(path = %self.path, "Offset store closed");
    }
}
