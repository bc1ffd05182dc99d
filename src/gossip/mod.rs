//! Gossip of quota tables between nodes.
//!
//! Every node periodically publishes its whole quota table on a shared topic
//! and merges every table it receives. Counters only grow and merge by
//! taking the per-node maximum, so tables converge no matter how often
//! messages are duplicated, reordered or dropped.
pub mod codec;
pub mod engine;
pub mod merge;

pub use codec::{Codec, JsonCodec};
pub use engine::QuotaEngine;
pub use merge::{merge_remote, KnownNodes, MergeReport};
