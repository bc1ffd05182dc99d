pub mod cli;
pub mod crdt;
pub mod error;
pub mod gossip;
pub mod node_id;
pub mod persistence;
pub mod quota;
pub mod settings;
pub mod transport;
pub mod ttl_cache;

pub use crdt::{GCounter, GrowOnlyCounter};
pub use error::{ErrorHandler, LogErrorHandler, QuotaError, Result};
pub use gossip::{MergeReport, QuotaEngine};
pub use node_id::NodeName;
pub use quota::{Metadata, Quota, QuotaStatus, QuotaTable};
