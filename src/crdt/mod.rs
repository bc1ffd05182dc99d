//! Conflict-free replicated counters.
//!
//! The quota engine only depends on the [`GrowOnlyCounter`] contract. Any
//! implementation must make `merge_from` commutative, associative and
//! idempotent, and must never decrease `total`.
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::node_id::NodeName;

pub mod gcounter;

pub use gcounter::GCounter;

/// A per-node partitioned counter that only grows.
pub trait GrowOnlyCounter:
    Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// A counter with zero total whose local partition belongs to `local`
    fn new(local: &NodeName) -> Self;

    /// Add `amount` to the local partition only
    fn increment(&mut self, amount: u64);

    /// Sum across every known partition
    fn total(&self) -> u64;

    /// Elementwise maximum of every partition in `other`
    fn merge_from(&mut self, other: &Self);
}
