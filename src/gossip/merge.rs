//! Reconciles a received quota table with the local one.
//!
//! Each remote entry is handled on its own:
//! - a tombstoned entry removes the local entry outright, including the
//!   echo of our own tombstone
//! - live entries we own ourselves are never merged back into our own table
//! - a live entry from another node has its counter merged into the local
//!   copy, creating that copy first if needed
//!
//! Whatever the branch, the entry's owner is marked live in `known_nodes`.
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::crdt::GrowOnlyCounter;
use crate::node_id::NodeName;
use crate::quota::QuotaTable;
use crate::ttl_cache::TtlCache;

/// Liveness cache of peers: node -> last time we saw its state
pub type KnownNodes = TtlCache<NodeName, DateTime<Utc>>;

/// What a single merge pass did to the local table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Remote counters merged into existing local quotas
    pub merged: usize,
    /// Local quotas created from remote state
    pub created: usize,
    /// Local quotas removed by remote tombstones
    pub removed: usize,
    /// Entries owned by this node that were left alone
    pub skipped_own: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.merged + self.created + self.removed > 0
    }
}

pub fn merge_remote<C: GrowOnlyCounter>(
    local: &mut QuotaTable<C>,
    remote: QuotaTable<C>,
    local_node: &NodeName,
    known_nodes: &KnownNodes,
) -> MergeReport {
    let mut report = MergeReport::default();

    for (id, incoming) in remote {
        if incoming.is_tombstoned() {
            if local.delete_now(&id).is_some() {
                debug!("[{}] Removed quota '{}' tombstoned by {}", local_node, id, incoming.owner);
                report.removed += 1;
            }
        } else if incoming.owner == *local_node {
            report.skipped_own += 1;
        } else if let Some(current) = local.get_mut(&id) {
            // A local tombstone stays in place; only the counts move forward
            current.counter.merge_from(&incoming.counter);
            report.merged += 1;
        } else {
            let created = local.initialize(
                local_node,
                incoming.max,
                0,
                &id,
                incoming.metadata.clone(),
            );
            created.counter.merge_from(&incoming.counter);
            debug!(
                "[{}] Created quota '{}' from {}: max={}, used={}",
                local_node,
                id,
                incoming.owner,
                created.limit(),
                created.used()
            );
            report.created += 1;
        }

        known_nodes.set(incoming.owner, Utc::now());
    }

    report
}
