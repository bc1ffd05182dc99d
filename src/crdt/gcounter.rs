use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::GrowOnlyCounter;
use crate::node_id::NodeName;

/// GCounter is a grow-only counter partitioned by node.
///
/// Each node only ever increments its own partition. Receiving another
/// node's counter takes the maximum of each partition, so applying the same
/// remote state twice, or in a different order, lands on the same total.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct GCounter {
    local: NodeName,
    partitions: BTreeMap<NodeName, u64>, // node -> count
}

impl GCounter {
    /// Get the count recorded for a specific node
    pub fn partition(&self, node: &NodeName) -> u64 {
        self.partitions.get(node).copied().unwrap_or(0)
    }

    /// Node that owns the local partition
    pub fn local_node(&self) -> &NodeName {
        &self.local
    }

    /// Get all nodes that have contributed to this counter
    pub fn node_names(&self) -> impl Iterator<Item = &NodeName> {
        self.partitions.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }
}

impl GrowOnlyCounter for GCounter {
    fn new(local: &NodeName) -> Self {
        Self {
            local: local.clone(),
            partitions: BTreeMap::new(),
        }
    }

    fn increment(&mut self, amount: u64) {
        if amount == 0 {
            return;
        }
        let count = self.partitions.entry(self.local.clone()).or_insert(0);
        *count = count.saturating_add(amount);
    }

    fn total(&self) -> u64 {
        self.partitions
            .values()
            .fold(0u64, |acc, count| acc.saturating_add(*count))
    }

    fn merge_from(&mut self, other: &Self) {
        for (node, &count) in &other.partitions {
            let entry = self.partitions.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }
}
