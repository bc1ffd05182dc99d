//! Storage backends the leader flushes quota tables to.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::crdt::{GCounter, GrowOnlyCounter};
use crate::error::BoxError;
use crate::quota::{Quota, QuotaTable};

/// Receives the full quota table on every leader flush tick
#[async_trait]
pub trait Flusher<C: GrowOnlyCounter>: Send + Sync {
    async fn flush(&self, quotas: &QuotaTable<C>) -> Result<(), BoxError>;
}

#[async_trait]
impl<C, F> Flusher<C> for Arc<F>
where
    C: GrowOnlyCounter,
    F: Flusher<C> + ?Sized,
{
    async fn flush(&self, quotas: &QuotaTable<C>) -> Result<(), BoxError> {
        (**self).flush(quotas).await
    }
}

#[derive(Debug)]
struct Stored<C> {
    quotas: HashMap<String, Quota<C>>,
    flush_count: u64,
    last_flushed_at: Option<DateTime<Utc>>,
}

/// Keeps the latest flushed copy of every quota in memory.
///
/// Entries are overwritten on each flush and never removed, so a quota that
/// was deleted after being flushed is still visible here.
#[derive(Debug)]
pub struct MemoryFlusher<C = GCounter> {
    stored: Mutex<Stored<C>>,
}

impl<C: GrowOnlyCounter> MemoryFlusher<C> {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(Stored {
                quotas: HashMap::new(),
                flush_count: 0,
                last_flushed_at: None,
            }),
        }
    }

    fn stored(&self) -> std::sync::MutexGuard<'_, Stored<C>> {
        self.stored.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Quota<C>> {
        self.stored().quotas.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.stored().quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored().quotas.is_empty()
    }

    pub fn flush_count(&self) -> u64 {
        self.stored().flush_count
    }

    pub fn last_flushed_at(&self) -> Option<DateTime<Utc>> {
        self.stored().last_flushed_at
    }
}

impl<C: GrowOnlyCounter> Default for MemoryFlusher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: GrowOnlyCounter> Flusher<C> for MemoryFlusher<C> {
    async fn flush(&self, quotas: &QuotaTable<C>) -> Result<(), BoxError> {
        let mut stored = self.stored();
        for (id, quota) in quotas.iter() {
            stored.quotas.insert(id.clone(), quota.clone());
        }
        stored.flush_count += 1;
        stored.last_flushed_at = Some(Utc::now());
        Ok(())
    }
}

/// Writes the table as pretty JSON, replacing the file atomically
#[derive(Clone, Debug)]
pub struct JsonFileFlusher {
    path: PathBuf,
}

impl JsonFileFlusher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back a table written by this flusher
    pub async fn load<C: GrowOnlyCounter>(&self) -> Result<QuotaTable<C>, BoxError> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[async_trait]
impl<C: GrowOnlyCounter> Flusher<C> for JsonFileFlusher {
    async fn flush(&self, quotas: &QuotaTable<C>) -> Result<(), BoxError> {
        let data = serde_json::to_vec_pretty(quotas)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            "Flushed {} quotas ({} bytes) to {}",
            quotas.len(),
            data.len(),
            self.path.display()
        );
        Ok(())
    }
}
