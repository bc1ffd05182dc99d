//! Engine and transport settings
use std::time::Duration;

use crate::node_id::NodeName;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_TOPIC: &str = "dquota.quotas";
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_LIVENESS_TTL_SECS: u64 = 60;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

#[derive(Clone, Debug)]
pub struct EngineSettings {
    // Identifier of this node; owner of every quota it creates
    pub node_name: NodeName,

    // How often the leader hands the quota table to the flusher
    pub flush_interval: Duration,

    // How long a peer counts as live after we last saw its state
    pub liveness_ttl: Duration,

    // Pause between subscribing and the first broadcast
    pub settle_delay: Duration,

    // Whether this node starts out as the leader
    pub is_leader: bool,
}

impl EngineSettings {
    pub fn new(node_name: impl Into<NodeName>) -> Self {
        Self {
            node_name: node_name.into(),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            liveness_ttl: Duration::from_secs(DEFAULT_LIVENESS_TTL_SECS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            is_leader: false,
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_liveness_ttl(mut self, liveness_ttl: Duration) -> Self {
        self.liveness_ttl = liveness_ttl;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_leader(mut self, is_leader: bool) -> Self {
        self.is_leader = is_leader;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub topic: String,
    pub broadcast_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            broadcast_interval: Duration::from_millis(DEFAULT_BROADCAST_INTERVAL_MS),
        }
    }
}
