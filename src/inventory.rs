//! Inventory and demand-cache persistence
//!
//! Owns the account's card instances, the per-card-type demand cache and
//! the on-disk snapshot of the current boost target. Files live under the
//! configured data directory as plain JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::types::{BoostTarget, CachedDemand, InventoryInstance};

const INVENTORY_FILE: &str = "inventory.json";
const CACHE_FILE: &str = "demand_cache.json";
const TARGET_FILE: &str = "target.json";

pub struct InventoryStore {
    data_dir: PathBuf,
    instances: Vec<InventoryInstance>,
    cache: HashMap<u64, CachedDemand>,
    cache_validity: ChronoDuration,
}

impl InventoryStore {
    /// Open the store, loading any existing files under `data_dir`.
    pub async fn open(data_dir: &Path, cache_validity_hours: i64) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir).await?;

        let instances = read_json(&data_dir.join(INVENTORY_FILE))
            .await
            .unwrap_or_default();
        let cache: HashMap<u64, CachedDemand> = read_json(&data_dir.join(CACHE_FILE))
            .await
            .unwrap_or_default();

        debug!(
            "Inventory store opened: {} instances, {} cached demands",
            instances.len(),
            cache.len()
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            instances,
            cache,
            cache_validity: ChronoDuration::hours(cache_validity_hours.max(0)),
        })
    }

    pub fn instances(&self) -> &[InventoryInstance] {
        &self.instances
    }

    /// Replace the instance list with a freshly fetched inventory.
    pub fn replace_instances(&mut self, instances: Vec<InventoryInstance>) {
        self.instances = instances;
    }

    /// Drop an instance from the unprobed pool.
    pub fn remove_instance(&mut self, instance_id: u64) {
        self.instances.retain(|i| i.instance_id != instance_id);
    }

    /// Cached demand for a card type, only if still inside the freshness
    /// window.
    pub fn fresh_demand(&self, item_id: u64) -> Option<&CachedDemand> {
        self.cache.get(&item_id).filter(|entry| {
            Utc::now().signed_duration_since(entry.parsed_at) < self.cache_validity
        })
    }

    /// Record a demand measurement. Last writer wins per card type.
    pub fn put_demand(&mut self, entry: CachedDemand) {
        self.cache.insert(entry.item_id, entry);
    }

    /// Point an existing cache entry at a different physical instance.
    pub fn rebind_demand_instance(&mut self, item_id: u64, instance_id: u64) {
        if let Some(entry) = self.cache.get_mut(&item_id) {
            entry.instance_id = instance_id;
        }
    }

    pub fn cached_demands(&self) -> impl Iterator<Item = &CachedDemand> {
        self.cache.values()
    }

    pub async fn save_instances(&self) -> anyhow::Result<()> {
        write_json(&self.data_dir.join(INVENTORY_FILE), &self.instances).await
    }

    pub async fn save_cache(&self) -> anyhow::Result<()> {
        write_json(&self.data_dir.join(CACHE_FILE), &self.cache).await
    }

    /// Last persisted boost target, if the snapshot file is present and
    /// parseable.
    pub async fn load_target(&self) -> Option<BoostTarget> {
        read_json(&self.data_dir.join(TARGET_FILE)).await
    }

    pub async fn save_target(&self, target: &BoostTarget) -> anyhow::Result<()> {
        write_json(&self.data_dir.join(TARGET_FILE), target).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt file {}: {}", path.display(), e);
                None
            }
        },
        Err(_) => None,
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).await?;
    debug!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(instance_id: u64, item_id: u64, tier: &str) -> InventoryInstance {
        InventoryInstance {
            instance_id,
            item_id,
            tier: tier.to_string(),
        }
    }

    fn demand(item_id: u64, count: u32, hours_old: i64) -> CachedDemand {
        CachedDemand {
            item_id,
            display_name: format!("card-{}", item_id),
            tier: "A".to_string(),
            demand_count: count,
            parsed_at: Utc::now() - ChronoDuration::hours(hours_old),
            instance_id: item_id * 10,
        }
    }

    #[tokio::test]
    async fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = InventoryStore::open(dir.path(), 24).await.unwrap();
            store.replace_instances(vec![instance(1, 100, "A"), instance(2, 101, "B")]);
            store.put_demand(demand(100, 7, 0));
            store.save_instances().await.unwrap();
            store.save_cache().await.unwrap();
            store
                .save_target(&BoostTarget {
                    item_id: 42,
                    display_name: "x".to_string(),
                    tier: "A".to_string(),
                    owners_count: 200,
                    wanters_count: 50,
                })
                .await
                .unwrap();
        }

        let store = InventoryStore::open(dir.path(), 24).await.unwrap();
        assert_eq!(store.instances().len(), 2);
        assert_eq!(store.fresh_demand(100).unwrap().demand_count, 7);
        assert_eq!(store.load_target().await.unwrap().item_id, 42);
    }

    #[tokio::test]
    async fn stale_cache_entries_are_not_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = InventoryStore::open(dir.path(), 24).await.unwrap();
        store.put_demand(demand(100, 7, 25));
        store.put_demand(demand(101, 3, 1));
        assert!(store.fresh_demand(100).is_none());
        assert!(store.fresh_demand(101).is_some());
    }

    #[tokio::test]
    async fn corrupt_target_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(TARGET_FILE), b"{not json")
            .await
            .unwrap();
        let store = InventoryStore::open(dir.path(), 24).await.unwrap();
        assert!(store.load_target().await.is_none());
    }

    #[tokio::test]
    async fn remove_instance_shrinks_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = InventoryStore::open(dir.path(), 24).await.unwrap();
        store.replace_instances(vec![instance(1, 100, "A"), instance(2, 100, "A")]);
        store.remove_instance(1);
        assert_eq!(store.instances().len(), 1);
        assert_eq!(store.instances()[0].instance_id, 2);
    }
}
