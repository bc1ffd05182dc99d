//! CLI for the demo cluster
//!
use std::path::PathBuf;
use std::time::Duration;

use crate::config_error;
use crate::error::Result;
use crate::settings::{self, EngineSettings, TransportSettings};

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Number of engines simulated in this process
    #[clap(
        long,
        default_value = "3",
        env("DQUOTA_NODES"),
        help = "Number of nodes to simulate"
    )]
    pub nodes: usize,

    // Pub/sub topic quota tables are broadcast on
    #[clap(
        long,
        default_value = settings::DEFAULT_TOPIC,
        env("DQUOTA_TOPIC"),
        help = "Topic to broadcast quota tables on"
    )]
    pub topic: String,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_BROADCAST_INTERVAL_MS,
        env("DQUOTA_BROADCAST_INTERVAL_MS"),
        help = "Milliseconds between quota table broadcasts"
    )]
    pub broadcast_interval_ms: u64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_FLUSH_INTERVAL_MS,
        env("DQUOTA_FLUSH_INTERVAL_MS"),
        help = "Milliseconds between leader flushes"
    )]
    pub flush_interval_ms: u64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_LIVENESS_TTL_SECS,
        env("DQUOTA_LIVENESS_TTL_SECS"),
        help = "Seconds a silent peer still counts as live"
    )]
    pub liveness_ttl_secs: u64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SETTLE_DELAY_MS,
        env("DQUOTA_SETTLE_DELAY_MS"),
        help = "Milliseconds to wait after subscribing before the first broadcast"
    )]
    pub settle_delay_ms: u64,

    // Quota the demo increments
    #[clap(long, default_value = "demo", env("DQUOTA_QUOTA_ID"), help = "Quota ID")]
    pub quota_id: String,

    #[clap(
        long,
        default_value = "100",
        env("DQUOTA_QUOTA_MAX"),
        help = "Quota limit"
    )]
    pub quota_max: u64,

    #[clap(
        long,
        default_value = "0",
        env("DQUOTA_INITIAL_VALUE"),
        help = "Initial usage, split across live nodes"
    )]
    pub initial_value: u64,

    #[clap(
        long,
        default_value = "1",
        env("DQUOTA_INCREMENTS"),
        help = "Amount each request increments the quota by"
    )]
    pub increments: u64,

    // Leader flushes here when set, otherwise to memory
    #[clap(
        long,
        env("DQUOTA_FLUSH_PATH"),
        help = "JSON file the leader flushes quotas to"
    )]
    pub flush_path: Option<PathBuf>,
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(config_error!("--nodes must be at least 1"));
        }
        if self.broadcast_interval_ms == 0 {
            return Err(config_error!("--broadcast-interval-ms must be greater than zero"));
        }
        if self.flush_interval_ms == 0 {
            return Err(config_error!("--flush-interval-ms must be greater than zero"));
        }
        if self.increments == 0 {
            return Err(config_error!("--increments must be greater than zero"));
        }
        Ok(())
    }

    /// Engine settings for simulated node `i`; node 0 leads
    pub fn into_settings(&self, i: usize) -> EngineSettings {
        EngineSettings::new(format!("node-{}", i))
            .with_flush_interval(Duration::from_millis(self.flush_interval_ms))
            .with_liveness_ttl(Duration::from_secs(self.liveness_ttl_secs))
            .with_settle_delay(Duration::from_millis(self.settle_delay_ms))
            .with_leader(i == 0)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            topic: self.topic.clone(),
            broadcast_interval: Duration::from_millis(self.broadcast_interval_ms),
        }
    }
}
