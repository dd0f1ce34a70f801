// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version conflict resolution.
//!
//! Given the entry currently stored for a key and an incoming replicated
//! entry, decide which one survives. Rules are evaluated in order and the
//! first match wins:
//!
//! 1. The incoming write was made by the local cluster: use new.
//! 2. Nothing is stored yet (start version): use new.
//! 3. Both versions come from the same cluster: higher `order` wins; on equal
//!    order, new wins only if it expires later (backups may carry a zeroed
//!    expiry that the primary corrects).
//! 4. Cross-cluster and a conflict field is configured: the larger field
//!    value wins, ties keep old. Extraction failures are logged and fall
//!    through.
//! 5. Otherwise the conflict is unresolved: log it and keep old.
//!
//! The resolver holds only immutable configuration and atomic counters, so
//! one instance is shared by every destination worker.

mod field;

pub use field::{ConflictField, FieldError, FieldValue};

use crate::entry::VersionedEntry;
use crate::metrics;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::{debug, error, Level};

/// Which of the two entries to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    UseOld,
    UseNew,
}

impl Decision {
    fn from_bool(use_new: bool) -> Self {
        if use_new {
            Decision::UseNew
        } else {
            Decision::UseOld
        }
    }

    pub fn is_use_new(self) -> bool {
        self == Decision::UseNew
    }
}

/// The rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    LocalWrite,
    StartVersion,
    SameClusterExpiry,
    SameClusterOrder,
    ConflictField,
    Unresolved,
}

impl Rule {
    pub fn as_str(self) -> &'static str {
        match self {
            Rule::LocalWrite => "local_write",
            Rule::StartVersion => "start_version",
            Rule::SameClusterExpiry => "same_cluster_expiry",
            Rule::SameClusterOrder => "same_cluster_order",
            Rule::ConflictField => "conflict_field",
            Rule::Unresolved => "unresolved",
        }
    }
}

/// Static replication identity of a streamer instance.
#[derive(Debug, Clone)]
pub struct ReplicationTopology {
    pub local_cluster_id: u8,
    pub conflict_field: Option<ConflictField>,
}

impl ReplicationTopology {
    pub fn new(local_cluster_id: u8) -> Self {
        Self {
            local_cluster_id,
            conflict_field: None,
        }
    }

    pub fn with_conflict_field(mut self, field: ConflictField) -> Self {
        self.conflict_field = Some(field);
        self
    }

    pub fn conflict_field_enabled(&self) -> bool {
        self.conflict_field.is_some()
    }
}

/// Outcome of one resolution call. Never persisted.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub old: &'a VersionedEntry,
    pub new: &'a VersionedEntry,
    pub decision: Decision,
    pub rule: Rule,
}

impl<'a> ConflictContext<'a> {
    /// The entry to write, or `None` when the stored one is kept.
    pub fn winner(&self) -> Option<&'a VersionedEntry> {
        match self.decision {
            Decision::UseNew => Some(self.new),
            Decision::UseOld => None,
        }
    }
}

/// Deterministic conflict resolver for one cluster.
#[derive(Debug)]
pub struct ConflictResolver {
    topology: ReplicationTopology,
    unresolved: AtomicU64,
}

impl ConflictResolver {
    pub fn new(topology: ReplicationTopology) -> Self {
        Self {
            topology,
            unresolved: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &ReplicationTopology {
        &self.topology
    }

    /// Number of conflicts that fell through to "keep old".
    pub fn unresolved_count(&self) -> u64 {
        self.unresolved.load(AtomicOrdering::Relaxed)
    }

    /// Decide between the stored entry and an incoming one.
    pub fn resolve(&self, old: &VersionedEntry, new: &VersionedEntry) -> Decision {
        self.context(old, new).decision
    }

    /// Resolve and keep both inputs alongside the decision.
    pub fn context<'a>(&self, old: &'a VersionedEntry, new: &'a VersionedEntry) -> ConflictContext<'a> {
        let (decision, rule) = self.decide(old, new);

        if tracing::enabled!(Level::DEBUG) {
            self.debug_resolve(old, new, decision, rule);
        }
        metrics::record_resolver_decision(rule.as_str(), decision.is_use_new());

        ConflictContext { old, new, decision, rule }
    }

    fn decide(&self, old: &VersionedEntry, new: &VersionedEntry) -> (Decision, Rule) {
        if new.version.cluster_id == self.topology.local_cluster_id {
            return (Decision::UseNew, Rule::LocalWrite);
        }

        if old.is_start_version {
            return (Decision::UseNew, Rule::StartVersion);
        }

        if let Some(cmp) = new.version.causal_cmp(&old.version) {
            return match cmp {
                Ordering::Equal => (
                    Decision::from_bool(new.expire_time > old.expire_time),
                    Rule::SameClusterExpiry,
                ),
                other => (Decision::from_bool(other == Ordering::Greater), Rule::SameClusterOrder),
            };
        }

        if let Some(field) = &self.topology.conflict_field {
            if !old.is_tombstone() && !new.is_tombstone() {
                match compare_field(field, old, new) {
                    Ok(cmp) => {
                        return (Decision::from_bool(cmp == Ordering::Greater), Rule::ConflictField);
                    }
                    Err(e) => {
                        error!(
                            field = %field.name(),
                            key = %new.key,
                            error = %e,
                            "Error while resolving replication conflict"
                        );
                    }
                }
            }
        }

        self.unresolved.fetch_add(1, AtomicOrdering::Relaxed);
        metrics::record_unresolved_conflict(new.operation());
        error!(
            key = %new.key,
            from_cluster = new.version.cluster_id,
            to_cluster = old.version.cluster_id,
            op = new.operation(),
            "Conflict can't be resolved, {} ignored",
            new.operation()
        );

        (Decision::UseOld, Rule::Unresolved)
    }

    fn debug_resolve(&self, old: &VersionedEntry, new: &VersionedEntry, decision: Decision, rule: Rule) {
        let (old_field, new_field) = match &self.topology.conflict_field {
            Some(field) => (debug_field(field, old), debug_field(field, new)),
            None => (String::from("-"), String::from("-")),
        };

        debug!(
            key = %new.key,
            start = old.is_start_version,
            old_ver = %old.version,
            new_ver = %new.version,
            old_expire = ?(old.ttl, old.expire_time),
            new_expire = ?(new.ttl, new.expire_time),
            old_field = %old_field,
            new_field = %new_field,
            rule = rule.as_str(),
            use_new = decision.is_use_new(),
            "Resolved conflict"
        );
    }
}

/// Compare the field of `new` against `old`.
fn compare_field(
    field: &ConflictField,
    old: &VersionedEntry,
    new: &VersionedEntry,
) -> Result<Ordering, FieldError> {
    let old_val = field.extract(old)?;
    let new_val = field.extract(new)?;
    new_val
        .compare(&old_val)
        .ok_or_else(|| FieldError::Incomparable(field.name().to_string()))
}

fn debug_field(field: &ConflictField, entry: &VersionedEntry) -> String {
    match field.extract(entry) {
        Ok(v) => v.to_string(),
        Err(e) => format!("<{}>", e),
    }
}
