//! Versioned entries: the unit of replication.
//!
//! Every change the local store emits carries a [`Version`] stamped by the
//! cluster that made the write. Versions from the same cluster are totally
//! ordered by `order`; versions from different clusters are not comparable by
//! `order` alone, which is what makes conflict resolution necessary.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Version stamp of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    /// Cluster that produced the write.
    pub cluster_id: u8,
    /// Per-cluster monotonic sequence.
    pub order: u64,
}

impl Version {
    pub fn new(cluster_id: u8, order: u64) -> Self {
        Self { cluster_id, order }
    }

    /// Order two versions of the same cluster.
    ///
    /// Returns `None` for versions from different clusters.
    pub fn causal_cmp(&self, other: &Version) -> Option<Ordering> {
        if self.cluster_id == other.cluster_id {
            Some(self.order.cmp(&other.order))
        } else {
            None
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cluster={}, order={}]", self.cluster_id, self.order)
    }
}

/// A key with its value (or tombstone), version and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub key: String,

    /// Payload; `None` is a removal.
    #[serde(default)]
    pub value: Option<serde_json::Value>,

    /// Type of the payload, announced on the metadata topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    pub version: Version,

    /// Time to live in milliseconds (0 = eternal).
    #[serde(default)]
    pub ttl: u64,

    /// Absolute expiry in epoch milliseconds (0 = never).
    #[serde(default)]
    pub expire_time: u64,

    /// Marks "no prior value exists". Any incoming write beats it.
    #[serde(default)]
    pub is_start_version: bool,
}

impl VersionedEntry {
    /// An update carrying `value`.
    pub fn put(
        key: impl Into<String>,
        value: serde_json::Value,
        type_name: Option<String>,
        version: Version,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            type_name,
            version,
            ttl: 0,
            expire_time: 0,
            is_start_version: false,
        }
    }

    /// A removal.
    pub fn tombstone(key: impl Into<String>, version: Version) -> Self {
        Self {
            key: key.into(),
            value: None,
            type_name: None,
            version,
            ttl: 0,
            expire_time: 0,
            is_start_version: false,
        }
    }

    /// Placeholder for a key the local store has never seen.
    pub fn start(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            type_name: None,
            version: Version::default(),
            ttl: 0,
            expire_time: 0,
            is_start_version: true,
        }
    }

    pub fn with_expiry(mut self, ttl: u64, expire_time: u64) -> Self {
        self.ttl = ttl;
        self.expire_time = expire_time;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// "update" or "remove", as used in conflict logs.
    pub fn operation(&self) -> &'static str {
        if self.is_tombstone() {
            "remove"
        } else {
            "update"
        }
    }
}
