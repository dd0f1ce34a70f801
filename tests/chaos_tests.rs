// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the pipeline handles failures without panics,
//! deadlocks, lost writes or offsets committed past unapplied data.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

#[macro_use]
mod common;

use cdc_replication::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
use cdc_replication::codec::{decode_entry, maybe_decompress, EncodedRecord};
use cdc_replication::metrics::{K2I_EVTS_RSVD_CNT, K2I_MSGS_SNT_CNT};
use cdc_replication::{
    CdcError, DestinationStreamer, EntryStore, MemoryTransport, OffsetStore, OffsetStoreConfig, StreamerState,
    Version, VersionedEntry,
};
use common::{pump, FaultyTransport, FlakyStore, TestCluster, CACHE};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

fn committed<S: EntryStore>(destination: &DestinationStreamer<S>) -> u64 {
    destination.metrics().snapshot().get(K2I_MSGS_SNT_CNT).unwrap_or(0)
}

fn file_config(path: &std::path::Path) -> OffsetStoreConfig {
    OffsetStoreConfig {
        sqlite_path: path.to_string_lossy().into_owned(),
        wal_mode: true,
    }
}

// =============================================================================
// Corrupted Data Handling
// =============================================================================

/// Test: Corrupted zstd data doesn't panic
#[tokio::test]
async fn corrupted_zstd_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &[0x28, 0xB5, 0x2F, 0xFD],
        // Magic header with garbage
        &[0x28, 0xB5, 0x2F, 0xFD, 0x00, 0x00, 0x00, 0x00],
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        let result = maybe_decompress(payload);
        assert!(result.is_err(), "Corrupted payload {} should return error, got Ok", i);

        // The same bytes on the wire are a poisoned record, not a crash.
        let record = EncodedRecord {
            cache: CACHE.to_string(),
            key: "k".to_string(),
            data: payload.to_vec(),
            hash: String::new(),
        };
        assert!(matches!(decode_entry(&record), Err(CdcError::Decompression(_))));
    }
}

/// Test: A valid body under the wrong key is rejected
#[tokio::test]
async fn swapped_key_is_rejected() {
    let entry = VersionedEntry::put("alice", json!({"n": 1}), None, Version::new(2, 1));
    let mut record = cdc_replication::codec::encode_entry(CACHE, &entry, 0).unwrap();
    record.key = "bob".to_string();

    let err = decode_entry(&record).unwrap_err();
    assert!(err.to_string().contains("does not match"));
}

/// Test: Malformed wire entries are skipped while the rest of the batch applies
#[tokio::test]
async fn malformed_wire_entries_are_skipped() {
    let transport = Arc::new(FaultyTransport::new());
    let a = TestCluster::new(1);
    let b = TestCluster::new(2);
    let a_config = a.config("a-to-b", "b-to-a");
    let b_config = b.config("b-to-a", "a-to-b");

    for i in 0..10 {
        a.put(&format!("k{}", i), json!({"n": i})).await;
    }
    pump(&a.source(&a_config, transport.clone())).await;

    transport.corrupt_next_records(3);
    let mut destination = b.destination(&b_config, transport.clone(), OffsetStoreConfig::in_memory());
    destination.start().await.unwrap();

    assert!(eventually!(WAIT, committed(&destination) == 10));
    assert_eq!(b.len().await, 7);
    assert_eq!(destination.metrics().snapshot().get(K2I_EVTS_RSVD_CNT), Some(10));
    assert_eq!(destination.state(), StreamerState::Running);
    destination.shutdown().await;
}

// =============================================================================
// Offset Store Durability
// =============================================================================

/// Test: Offsets survive a crash between commits
///
/// Only the last committed offsets are visible after reopening; anything
/// applied after them is read again.
#[tokio::test]
async fn offset_crash_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offsets.db");

    {
        let store = OffsetStore::open(&file_config(&path)).await.unwrap();
        store.commit("g", "t", &[(0, "1000-0".to_string())]).await.unwrap();
        store.commit("g", "t", &[(0, "2000-0".to_string()), (1, "1500-3".to_string())]).await.unwrap();
        // Dropped without close or checkpoint.
    }

    let store = OffsetStore::open(&file_config(&path)).await.unwrap();
    let loaded = store.load("g", "t", &[0, 1, 2]).await.unwrap();
    assert_eq!(
        loaded,
        vec![
            (0, "2000-0".to_string()),
            (1, "1500-3".to_string()),
            (2, "0".to_string()),
        ]
    );
    store.close().await;
}

/// Test: Groups and topics never see each other's offsets
#[tokio::test]
async fn offset_isolation() {
    let store = OffsetStore::in_memory().await.unwrap();

    store.commit("group-a", "topic-1", &[(0, "10-0".to_string())]).await.unwrap();
    store.commit("group-b", "topic-1", &[(0, "20-0".to_string())]).await.unwrap();
    store.commit("group-a", "topic-2", &[(0, "30-0".to_string())]).await.unwrap();

    assert_eq!(store.load("group-a", "topic-1", &[0]).await.unwrap()[0].1, "10-0");
    assert_eq!(store.load("group-b", "topic-1", &[0]).await.unwrap()[0].1, "20-0");
    assert_eq!(store.load("group-a", "topic-2", &[0]).await.unwrap()[0].1, "30-0");
    assert_eq!(store.load("group-c", "topic-1", &[0]).await.unwrap()[0].1, "0");
}

/// Test: Rapid commits keep the last value
#[tokio::test]
async fn offset_rapid_commits() {
    let dir = tempdir().unwrap();
    let store = OffsetStore::open(&file_config(&dir.path().join("offsets.db"))).await.unwrap();

    for i in 0..500 {
        store.commit("g", "t", &[(i % 4, format!("{}-0", i))]).await.unwrap();
    }

    let loaded = store.load("g", "t", &[0, 1, 2, 3]).await.unwrap();
    assert_eq!(loaded[3], (3, "499-0".to_string()));
    assert_eq!(loaded[0], (0, "496-0".to_string()));
}

// =============================================================================
// Circuit Breaker Stress Tests
// =============================================================================

/// Test: An open circuit keeps calls away from a failing store
#[tokio::test]
async fn circuit_breaker_prevents_cascade() {
    let store = FlakyStore::new();
    store.fail_always(true);
    let circuit = StoreCircuit::with_configs(
        CircuitConfig {
            recovery_timeout: Duration::from_millis(100),
            ..CircuitConfig::testing()
        },
        CircuitConfig::testing(),
    );

    for i in 0..10 {
        let entry = VersionedEntry::put("k", json!(i), None, Version::new(2, i));
        let err = circuit.apply(&store, CACHE, entry).await.unwrap_err();
        assert!(err.is_retryable());
    }

    // Rejected calls never reached the store.
    assert!(circuit.writes.rejections() > 0);
    assert!(store.attempts() < 10);
    assert!(circuit.any_rejecting());

    // After the recovery timeout a healthy store closes the circuit again.
    store.fail_always(false);
    sleep(Duration::from_millis(150)).await;
    let entry = VersionedEntry::put("k", json!("ok"), None, Version::new(2, 100));
    circuit.apply(&store, CACHE, entry).await.unwrap();
    assert_eq!(store.inner.value(CACHE, "k").await, Some(json!("ok")));
}

/// Test: Circuit breaker with rapid failure/success cycles
#[tokio::test]
async fn circuit_breaker_rapid_cycles() {
    let circuit = CircuitBreaker::new(
        "rapid-cycle",
        CircuitConfig {
            recovery_timeout: Duration::from_millis(10),
            ..CircuitConfig::testing()
        },
    );

    for cycle in 0..5 {
        for _ in 0..2 {
            let _: Result<(), CircuitError<&str>> = circuit.call(|| async { Err("fail") }).await;
        }

        sleep(Duration::from_millis(15)).await;

        let result: Result<i32, CircuitError<&str>> = circuit.call(|| async { Ok(42) }).await;
        assert!(result.is_ok(), "Cycle {} should succeed after recovery", cycle);
    }
}

/// Test: Concurrent circuit breaker access
#[tokio::test]
async fn circuit_breaker_concurrent_access() {
    use tokio::task::JoinSet;

    let circuit = Arc::new(CircuitBreaker::new("concurrent", CircuitConfig::default()));
    let mut tasks = JoinSet::new();
    let success_count = Arc::new(AtomicU32::new(0));

    for _ in 0..100 {
        let c = circuit.clone();
        let sc = success_count.clone();
        tasks.spawn(async move {
            let result: Result<(), CircuitError<&str>> = c.call(|| async { Ok(()) }).await;
            if result.is_ok() {
                sc.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    while let Some(r) = tasks.join_next().await {
        r.unwrap();
    }

    assert_eq!(success_count.load(Ordering::Relaxed), 100);
    assert_eq!(circuit.calls_total(), 100);
}

// =============================================================================
// Pipeline Under Pressure
// =============================================================================

/// Test: Shutdown during retry backoff leaves the batch for the next run
#[tokio::test]
async fn shutdown_during_retry_leaves_batch_uncommitted() {
    let dir = tempdir().unwrap();
    let offsets = file_config(&dir.path().join("offsets.db"));
    let transport = Arc::new(MemoryTransport::new());
    let a = TestCluster::new(1);
    let a_config = a.config("a-to-b", "b-to-a");
    for i in 0..5 {
        a.put(&format!("k{}", i), json!({"n": i})).await;
    }
    pump(&a.source(&a_config, transport.clone())).await;

    // Unbounded retries against a store that never recovers.
    let store = Arc::new(FlakyStore::new());
    store.fail_always(true);
    let b_config = TestCluster::new(2).config("b-to-a", "a-to-b");
    let mut destination = DestinationStreamer::new(
        b_config.destination.clone(),
        b_config.topology.build().unwrap(),
        Arc::clone(&store),
        transport.clone(),
        offsets.clone(),
    )
    .unwrap()
    .with_circuit(StoreCircuit::with_configs(CircuitConfig::testing(), CircuitConfig::testing()));
    destination.start().await.unwrap();

    assert!(eventually!(WAIT, store.attempts() >= 3));

    let started = Instant::now();
    destination.shutdown().await;
    assert!(started.elapsed() < WAIT);
    assert_eq!(destination.state(), StreamerState::Stopped);
    assert_eq!(committed(&destination), 0);

    let reopened = OffsetStore::open(&offsets).await.unwrap();
    let loaded = reopened
        .load(&b_config.destination.group_id, "a-to-b", &(0..8).collect::<Vec<u32>>())
        .await
        .unwrap();
    assert!(loaded.iter().all(|(_, offset)| offset == "0"));
    reopened.close().await;

    // A healthy restart applies everything that was left behind.
    store.fail_always(false);
    let mut restarted = DestinationStreamer::new(
        b_config.destination.clone(),
        b_config.topology.build().unwrap(),
        Arc::clone(&store),
        transport.clone(),
        offsets,
    )
    .unwrap();
    restarted.start().await.unwrap();
    assert!(eventually!(WAIT, store.inner.len(CACHE).await == 5));
    restarted.shutdown().await;
}

/// Test: Workers hold off while the store signals backpressure
#[tokio::test]
async fn backpressure_pauses_apply() {
    let transport = Arc::new(MemoryTransport::new());
    let a = TestCluster::new(1);
    let b = TestCluster::new(2);
    let a_config = a.config("a-to-b", "b-to-a");
    let b_config = b.config("b-to-a", "a-to-b");

    for i in 0..5 {
        a.put(&format!("k{}", i), json!({"n": i})).await;
    }
    pump(&a.source(&a_config, transport.clone())).await;

    b.store.set_accepting_writes(false);
    let mut destination = b.destination(&b_config, transport.clone(), OffsetStoreConfig::in_memory());
    destination.start().await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(b.len().await, 0);

    b.store.set_accepting_writes(true);
    assert!(eventually!(WAIT, b.len().await == 5));
    destination.shutdown().await;
}

/// Test: Store writes are throttled by the rate limiter
#[tokio::test]
async fn rate_limit_throttles_apply() {
    let transport = Arc::new(MemoryTransport::new());
    let a = TestCluster::new(1);
    let b = TestCluster::new(2);
    let a_config = a.config("a-to-b", "b-to-a");
    let mut b_config = b.config("b-to-a", "a-to-b");
    b_config.destination.rate_limit_enabled = true;
    b_config.destination.rate_limit_per_sec = 50;
    b_config.destination.rate_limit_burst = 5;

    for i in 0..20 {
        a.put(&format!("k{}", i), json!({"n": i})).await;
    }
    pump(&a.source(&a_config, transport.clone())).await;

    let started = Instant::now();
    let mut destination = b.destination(&b_config, transport.clone(), OffsetStoreConfig::in_memory());
    destination.start().await.unwrap();
    assert!(eventually!(WAIT, b.len().await == 20));

    // 5 burst, then 15 at 50/s.
    assert!(started.elapsed() >= Duration::from_millis(200));
    destination.shutdown().await;
}

/// Test: Many writers on one key leave the highest version at the destination
#[tokio::test]
async fn concurrent_writers_converge() {
    let transport = Arc::new(MemoryTransport::new());
    let a = Arc::new(TestCluster::new(1));
    let b = TestCluster::new(2);
    let a_config = a.config("a-to-b", "b-to-a");
    let b_config = b.config("b-to-a", "a-to-b");

    let mut writers = Vec::new();
    for w in 0..4 {
        let a = Arc::clone(&a);
        writers.push(tokio::spawn(async move {
            let mut written = Vec::new();
            for i in 0..25 {
                let key = format!("hot-{}", i % 3);
                let version = a.put(&key, json!({"writer": w, "i": i})).await;
                written.push((key, version));
            }
            written
        }));
    }

    let mut newest: HashMap<String, Version> = HashMap::new();
    for written in futures::future::join_all(writers).await {
        for (key, version) in written.unwrap() {
            let slot = newest.entry(key).or_insert(version);
            if version.order > slot.order {
                *slot = version;
            }
        }
    }
    pump(&a.source(&a_config, transport.clone())).await;

    let mut destination = b.destination(&b_config, transport.clone(), OffsetStoreConfig::in_memory());
    destination.start().await.unwrap();
    assert!(eventually!(WAIT, committed(&destination) == 100));

    // Interleaved local writes may land out of version order; the
    // destination still keeps the highest version of each key.
    for (key, version) in &newest {
        assert_eq!(b.get(key).await.unwrap().version, *version, "{} diverged", key);
    }
    destination.shutdown().await;
}
