use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Metadata, Quota, QuotaStatus};
use crate::crdt::{GCounter, GrowOnlyCounter};
use crate::node_id::NodeName;

/// Every quota known to one engine, keyed by quota ID.
/// Access to this *whole* data structure requires mutability
/// so it should live inside something like a Mutex.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct QuotaTable<C = GCounter> {
    quotas: HashMap<String, Quota<C>>,
}

impl<C: GrowOnlyCounter> QuotaTable<C> {
    pub fn new() -> Self {
        Self {
            quotas: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Quota<C>> {
        self.quotas.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Quota<C>> {
        self.quotas.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.quotas.contains_key(id)
    }

    pub fn insert(&mut self, quota: Quota<C>) -> Option<Quota<C>> {
        self.quotas.insert(quota.id.clone(), quota)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quota<C>)> {
        self.quotas.iter()
    }

    /// Create or top up a quota.
    ///
    /// A missing or tombstoned entry is replaced by a fresh quota owned by
    /// `local`. The total is then pushed forward to at least `initial_value`
    /// and the limit is set if it was still unset.
    pub fn initialize(
        &mut self,
        local: &NodeName,
        max: u64,
        initial_value: u64,
        id: &str,
        metadata: Metadata,
    ) -> &mut Quota<C> {
        let quota = self
            .quotas
            .entry(id.to_string())
            .and_modify(|existing| {
                if existing.is_tombstoned() {
                    *existing = Quota::new(id, local, metadata.clone());
                }
            })
            .or_insert_with(|| Quota::new(id, local, metadata));
        quota.advance_to(initial_value);
        quota.set_limit_once(max);
        quota
    }

    pub fn increment_by(&mut self, id: &str, amount: u64) -> QuotaStatus {
        match self.quotas.get_mut(id) {
            Some(quota) => quota.increment_by(amount),
            None => QuotaStatus::NotFound,
        }
    }

    /// Mark a quota deleted; returns false if it was not present
    pub fn tag_delete(&mut self, id: &str) -> bool {
        match self.quotas.get_mut(id) {
            Some(quota) => {
                quota.tombstoned = true;
                true
            }
            None => false,
        }
    }

    /// Physically remove a quota
    pub fn delete_now(&mut self, id: &str) -> Option<Quota<C>> {
        self.quotas.remove(id)
    }

    /// Used count for every active quota
    pub fn usage(&self) -> HashMap<String, u64> {
        self.quotas
            .iter()
            .filter(|(_, quota)| !quota.is_tombstoned())
            .map(|(id, quota)| (id.clone(), quota.used()))
            .collect()
    }
}

impl<C: GrowOnlyCounter> Default for QuotaTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: GrowOnlyCounter> FromIterator<Quota<C>> for QuotaTable<C> {
    fn from_iter<I: IntoIterator<Item = Quota<C>>>(iter: I) -> Self {
        let mut table = Self::new();
        for quota in iter {
            table.insert(quota);
        }
        table
    }
}

impl<C> IntoIterator for QuotaTable<C> {
    type Item = (String, Quota<C>);
    type IntoIter = std::collections::hash_map::IntoIter<String, Quota<C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.quotas.into_iter()
    }
}
