//! Payload codec for broadcast quota tables.
use crate::crdt::GrowOnlyCounter;
use crate::error::BoxError;
use crate::quota::QuotaTable;

/// Turns a full quota table into a payload and back
pub trait Codec<C: GrowOnlyCounter>: Send + Sync {
    fn encode(&self, quotas: &QuotaTable<C>) -> Result<Vec<u8>, BoxError>;
    fn decode(&self, payload: &[u8]) -> Result<QuotaTable<C>, BoxError>;
}

/// JSON payloads: `{ "<quota id>": { "id", "owner", "max", "counter", "tombstoned", "metadata" } }`
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<C: GrowOnlyCounter> Codec<C> for JsonCodec {
    fn encode(&self, quotas: &QuotaTable<C>) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(quotas)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<QuotaTable<C>, BoxError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
