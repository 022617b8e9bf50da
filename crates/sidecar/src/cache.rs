//! Container fingerprint cache — spec §3, §4.2.
//!
//! Maps `ServiceID -> InspectedContainer`, populated lazily at
//! health-check discovery time. Pruned in lockstep with each discovery
//! refresh, and drained wholesale every 10 minutes to bound memory.
//!
//! Grounded on `crates/agent/src/service/background.rs`
//! (`perform_mark_and_sweep`, `background_inventory_sync`): the same
//! upsert-then-retain shape, applied here to inspected-container metadata
//! instead of the live inventory itself.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;

/// Interval between wholesale cache drains (spec §4.2 / §3: "every 10
/// min").
pub const WHOLESALE_DRAIN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Fingerprint cache keyed by `Service.id`.
///
/// Safe under concurrent readers and a single writer: [`DashMap`]
/// shards handle the fine-grained locking, and [`ContainerCache::prune`]
/// plus the wholesale drain are the only operations that touch more than
/// one entry at a time.
pub struct ContainerCache<T> {
    entries: DashMap<String, T>,
}

impl<T: Clone> ContainerCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn set(&self, id: String, data: T) {
        self.entries.insert(id, data);
    }

    /// Remove every entry whose ID is absent from `live`.
    pub fn prune(&self, live: &HashSet<String>) {
        self.entries.retain(|id, _| live.contains(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, unconditionally. Called every
    /// [`WHOLESALE_DRAIN_INTERVAL`] to bound memory growth from IDs that
    /// `prune` alone would never see again (a service that vanishes
    /// between two `prune` calls without ever reappearing in `live`).
    pub fn drain_all(&self) {
        self.entries.clear();
    }
}

impl<T: Clone> Default for ContainerCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
