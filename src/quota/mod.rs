use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crdt::{GCounter, GrowOnlyCounter};
use crate::node_id::NodeName;

pub mod table;

pub use table::QuotaTable;

/// Caller-supplied annotations carried with a quota, never interpreted here.
pub type Metadata = BTreeMap<String, String>;

/// Outcome of incrementing a quota. These are results, not errors.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    /// Total is still below the limit
    Ok,
    /// Total has reached or passed the limit
    Violated,
    /// No active quota with that ID
    NotFound,
}

impl std::fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaStatus::Ok => write!(f, "ok"),
            QuotaStatus::Violated => write!(f, "violated"),
            QuotaStatus::NotFound => write!(f, "not_found"),
        }
    }
}

/// A named, capped counter tracked across the cluster.
///
/// `max == 0` means the limit has not been set yet. Once set it is never
/// overwritten for the lifetime of this quota ID.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Quota<C = GCounter> {
    pub id: String,
    /// Node that created this copy locally
    pub owner: NodeName,
    pub max: u64,
    pub counter: C,
    #[serde(default)]
    pub tombstoned: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl<C: GrowOnlyCounter> Quota<C> {
    /// A fresh quota owned by `owner`: no limit yet, zero total
    pub fn new(id: impl Into<String>, owner: &NodeName, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            owner: owner.clone(),
            max: 0,
            counter: C::new(owner),
            tombstoned: false,
            metadata,
        }
    }

    /// Add `amount` to the local partition, then report the status.
    ///
    /// The increment is applied even when it pushes the total past the limit.
    /// Tombstoned quotas refuse increments and report `NotFound`.
    pub fn increment_by(&mut self, amount: u64) -> QuotaStatus {
        if self.tombstoned {
            return QuotaStatus::NotFound;
        }
        self.counter.increment(amount);
        self.status()
    }

    pub fn status(&self) -> QuotaStatus {
        if self.used() >= self.max {
            QuotaStatus::Violated
        } else {
            QuotaStatus::Ok
        }
    }

    pub fn used(&self) -> u64 {
        self.counter.total()
    }

    pub fn limit(&self) -> u64 {
        self.max
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned
    }

    pub fn has_limit(&self) -> bool {
        self.max != 0
    }

    /// Set the limit unless one is already in place
    pub fn set_limit_once(&mut self, max: u64) {
        if self.max == 0 {
            self.max = max;
        }
    }

    /// Increment forward until the total is at least `target`
    pub fn advance_to(&mut self, target: u64) {
        let used = self.used();
        if used < target {
            self.counter.increment(target - used);
        }
    }
}
