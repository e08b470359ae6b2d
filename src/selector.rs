//! Trade-card selection engine
//!
//! Picks which inventory instance to offer a counterparty. Cards nobody
//! wants are the cheapest to give away, so the engine prefers candidates
//! whose demand does not exceed the target's, probing undiscovered cards
//! first and falling back to the demand cache only when probing produced
//! nothing at all.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::api::SiteSession;
use crate::config::BotConfig;
use crate::inventory::InventoryStore;
use crate::types::{CachedDemand, InventoryInstance};

/// Selection tunables.
#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// Demand at or below this compares as zero.
    pub low_demand_threshold: u32,
    /// Cards above this demand are never offered.
    pub demand_ceiling: u32,
    /// Bounded attempt budget for the unprobed-first phase.
    pub max_probe_attempts: u32,
    /// Flush the demand cache after this many new probes.
    pub cache_flush_every: u32,
}

impl From<&BotConfig> for SelectorConfig {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            low_demand_threshold: cfg.low_demand_threshold,
            demand_ceiling: cfg.demand_ceiling,
            max_probe_attempts: cfg.max_probe_attempts,
            cache_flush_every: cfg.cache_flush_every.max(1),
        }
    }
}

/// Demand values at or below the threshold are interchangeable.
pub fn normalize_demand(demand: u32, threshold: u32) -> u32 {
    if demand <= threshold {
        0
    } else {
        demand
    }
}

/// A selected instance together with the demand that justified it.
#[derive(Debug, Clone)]
pub struct Pick {
    pub instance: InventoryInstance,
    pub demand: u32,
    pub from_cache: bool,
}

pub struct Selector {
    session: Arc<dyn SiteSession>,
    cfg: SelectorConfig,
}

impl Selector {
    pub fn new(session: Arc<dyn SiteSession>, cfg: SelectorConfig) -> Self {
        Self { session, cfg }
    }

    /// The session used for live demand probes.
    pub fn session(&self) -> &Arc<dyn SiteSession> {
        &self.session
    }

    fn norm(&self, demand: u32) -> u32 {
        normalize_demand(demand, self.cfg.low_demand_threshold)
    }

    /// Pick one instance of `target_tier` to offer, or nothing if the
    /// whole inventory is unsuitable.
    ///
    /// `excluded` carries instance ids that must not be picked: locked by
    /// in-flight offers, already consumed, or already offered this cycle.
    pub async fn select(
        &self,
        store: &mut InventoryStore,
        target_tier: &str,
        target_demand: u32,
        excluded: &HashSet<u64>,
    ) -> Option<Pick> {
        let mut candidates: Vec<InventoryInstance> = store
            .instances()
            .iter()
            .filter(|i| {
                i.tier == target_tier
                    && !excluded.contains(&i.instance_id)
                    && store.fresh_demand(i.item_id).is_none()
            })
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        debug!(
            "Selecting for tier {} with target demand {} ({} unprobed candidates)",
            target_tier,
            target_demand,
            candidates.len()
        );

        let (pick, probed) = self
            .probe_unprobed(store, candidates, target_demand)
            .await;

        if probed > 0 {
            if let Err(e) = store.save_cache().await {
                warn!("Demand cache flush failed: {}", e);
            }
            if let Err(e) = store.save_instances().await {
                warn!("Inventory flush failed: {}", e);
            }
        }

        if pick.is_some() {
            return pick;
        }

        self.select_from_cache(store, target_tier, target_demand, excluded)
    }

    /// Unprobed-first phase. Probes shuffled candidates one at a time and
    /// returns the first whose demand qualifies; this is a short circuit,
    /// not an exhaustive search. Tracks the closest overshoot as a
    /// fallback, and keeps probing past the attempt budget only while
    /// such a fallback exists.
    ///
    /// Returns the pick (qualifying hit or best alternative) and how many
    /// live probes were made.
    async fn probe_unprobed(
        &self,
        store: &mut InventoryStore,
        mut candidates: Vec<InventoryInstance>,
        target_demand: u32,
    ) -> (Option<Pick>, u32) {
        let norm_target = self.norm(target_demand);
        let mut attempts = 0u32;
        let mut probed = 0u32;
        let mut best_alt: Option<Pick> = None;

        while let Some(candidate) = candidates.pop() {
            attempts += 1;

            // A probe earlier in this search may have covered the same
            // card type; reuse it instead of spending a request.
            let already_cached = store.fresh_demand(candidate.item_id).map(|e| e.demand_count);
            let demand = if let Some(demand) = already_cached {
                store.rebind_demand_instance(candidate.item_id, candidate.instance_id);
                Some(demand)
            } else {
                match self.session.count_wants(candidate.item_id).await {
                    Ok(demand) => {
                        probed += 1;
                        store.put_demand(CachedDemand {
                            item_id: candidate.item_id,
                            display_name: String::new(),
                            tier: candidate.tier.clone(),
                            demand_count: demand,
                            parsed_at: Utc::now(),
                            instance_id: candidate.instance_id,
                        });
                        store.remove_instance(candidate.instance_id);
                        if probed % self.cfg.cache_flush_every == 0 {
                            if let Err(e) = store.save_cache().await {
                                warn!("Demand cache flush failed: {}", e);
                            }
                        }
                        Some(demand)
                    }
                    Err(e) => {
                        debug!(
                            "Demand probe for card {} failed, skipping: {}",
                            candidate.item_id, e
                        );
                        None
                    }
                }
            };

            if let Some(demand) = demand {
                if demand <= self.cfg.demand_ceiling {
                    if self.norm(demand) <= norm_target {
                        info!(
                            "Selected freshly probed instance {} (demand {} vs target {}) after {} attempts",
                            candidate.instance_id, demand, target_demand, attempts
                        );
                        return (
                            Some(Pick {
                                instance: candidate,
                                demand,
                                from_cache: false,
                            }),
                            probed,
                        );
                    }
                    // Closest overshoot wins the fallback slot.
                    if demand > target_demand
                        && best_alt.as_ref().map_or(true, |alt| demand < alt.demand)
                    {
                        best_alt = Some(Pick {
                            instance: candidate.clone(),
                            demand,
                            from_cache: false,
                        });
                    }
                } else {
                    debug!(
                        "Card {} over demand ceiling ({} > {})",
                        candidate.item_id, demand, self.cfg.demand_ceiling
                    );
                }
            }

            if attempts >= self.cfg.max_probe_attempts && best_alt.is_none() {
                break;
            }
        }

        if let Some(alt) = &best_alt {
            info!(
                "No qualifying card; using closest overshoot instance {} (demand {} vs target {})",
                alt.instance.instance_id, alt.demand, target_demand
            );
        }
        (best_alt, probed)
    }

    /// Cached-inventory fallback, entered only when probing yielded
    /// nothing at all. Prefers a uniformly random entry whose demand
    /// qualifies; otherwise the overshoot entry closest to the target.
    fn select_from_cache(
        &self,
        store: &InventoryStore,
        target_tier: &str,
        target_demand: u32,
        excluded: &HashSet<u64>,
    ) -> Option<Pick> {
        let norm_target = self.norm(target_demand);
        let mut priority: Vec<&CachedDemand> = Vec::new();
        let mut overshoot: Vec<&CachedDemand> = Vec::new();

        for entry in store.cached_demands() {
            if entry.tier != target_tier
                || excluded.contains(&entry.instance_id)
                || entry.demand_count > self.cfg.demand_ceiling
            {
                continue;
            }
            if self.norm(entry.demand_count) <= norm_target {
                priority.push(entry);
            } else {
                overshoot.push(entry);
            }
        }

        if let Some(entry) = priority.choose(&mut rand::thread_rng()) {
            info!(
                "Selected cached instance {} (demand {} vs target {})",
                entry.instance_id, entry.demand_count, target_demand
            );
            return Some(Pick {
                instance: entry.instance(),
                demand: entry.demand_count,
                from_cache: true,
            });
        }

        let closest = overshoot.into_iter().min_by_key(|e| e.demand_count)?;
        info!(
            "Selected cached overshoot instance {} (demand {} vs target {})",
            closest.instance_id, closest.demand_count, target_demand
        );
        Some(Pick {
            instance: closest.instance(),
            demand: closest.demand_count,
            from_cache: true,
        })
    }
}
