//! Key-to-partition routing and partition range slicing.
//!
//! Every cluster must route a key to the same partition, so the hash is
//! SHA-256 based rather than `std`'s hasher (randomized and unstable across
//! toolchains).

use crate::error::{CdcError, Result};
use sha2::{Digest, Sha256};
use std::ops::Range;

/// Partition of `key` in a topic with `partitions` partitions.
///
/// `partitions` must be non-zero; configs are validated before use.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

/// A half-open range `[from, to)` of partitions owned by one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub from: u32,
    pub to: u32,
}

impl PartitionRange {
    pub fn new(from: u32, to: u32) -> Result<Self> {
        if from >= to {
            return Err(CdcError::Config(format!(
                "partition range [{}, {}) is empty",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    pub fn len(&self) -> u32 {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn contains(&self, partition: u32) -> bool {
        partition >= self.from && partition < self.to
    }

    pub fn iter(&self) -> Range<u32> {
        self.from..self.to
    }

    /// Slice the range into `workers` contiguous, disjoint parts.
    ///
    /// Sizes differ by at most one; the first `len % workers` parts are the
    /// larger ones.
    pub fn split(&self, workers: usize) -> Result<Vec<Vec<u32>>> {
        let len = self.len() as usize;
        if workers == 0 {
            return Err(CdcError::Config("thread_count must be > 0".to_string()));
        }
        if workers > len {
            return Err(CdcError::Config(format!(
                "thread_count {} exceeds the {} partitions in [{}, {})",
                workers, len, self.from, self.to
            )));
        }

        let base = len / workers;
        let extra = len % workers;
        let mut next = self.from;
        let mut slices = Vec::with_capacity(workers);

        for i in 0..workers {
            let size = (base + usize::from(i < extra)) as u32;
            slices.push((next..next + size).collect());
            next += size;
        }

        Ok(slices)
    }
}
