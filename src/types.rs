//! Core data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The card currently being collected toward in the club boost.
///
/// Mutated only by a replacement; read every cycle. Persisted to disk after
/// each load so a restart resumes with the last known target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostTarget {
    pub item_id: u64,
    pub display_name: String,
    pub tier: String,
    pub owners_count: u32,
    pub wanters_count: u32,
}

/// One physical copy of a card owned by the operating account.
///
/// Immutable once loaded; locked while an offer referencing it is in
/// flight and consumed when that offer completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryInstance {
    pub instance_id: u64,
    pub item_id: u64,
    pub tier: String,
}

/// A memoized demand measurement for a card type.
///
/// One entry per item type, last writer wins. `instance_id` records which
/// physical copy most recently produced the measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDemand {
    pub item_id: u64,
    pub display_name: String,
    pub tier: String,
    pub demand_count: u32,
    pub parsed_at: DateTime<Utc>,
    pub instance_id: u64,
}

impl CachedDemand {
    /// The inventory instance this measurement currently maps to.
    pub fn instance(&self) -> InventoryInstance {
        InventoryInstance {
            instance_id: self.instance_id,
            item_id: self.item_id,
            tier: self.tier.clone(),
        }
    }
}

/// Remaining daily allowances, refreshed from the service on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub donations_remaining: u32,
    pub replacements_remaining: u32,
}

/// A counterparty who holds the current target and may receive an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: u64,
    pub username: String,
}

/// Server-assigned id of a sent trade offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferId(pub String);

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
