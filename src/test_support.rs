//! In-memory service stub shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::api::{Authenticator, SiteSession};
use crate::error::{ApiError, AuthError};
use crate::types::{BoostTarget, InventoryInstance, OfferId, Owner, QuotaSnapshot};

/// Programmable stand-in for the card service.
///
/// Every knob is interior-mutable so tests hold a plain `Arc<StubSite>`
/// next to the `Arc<dyn SiteSession>` handed to the code under test.
pub struct StubSite {
    pub live: AtomicBool,
    refresh_restores: AtomicBool,
    wants: Mutex<HashMap<u64, u32>>,
    want_errors: Mutex<HashSet<u64>>,
    probes: AtomicU32,
    quota: Mutex<QuotaSnapshot>,
    pub quota_fetches: AtomicU32,
    target: Mutex<BoostTarget>,
    /// Whether submit_replacement advances the target to a new card.
    pub replacement_advances: AtomicBool,
    owners: Mutex<Vec<Owner>>,
    inventory: Mutex<Vec<InventoryInstance>>,
    open_offers: Mutex<HashSet<String>>,
    refuse_cancel: Mutex<HashSet<String>>,
    next_offer: AtomicU64,
    completed_trades: AtomicU64,
}

impl StubSite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(true),
            refresh_restores: AtomicBool::new(false),
            wants: Mutex::new(HashMap::new()),
            want_errors: Mutex::new(HashSet::new()),
            probes: AtomicU32::new(0),
            quota: Mutex::new(QuotaSnapshot {
                donations_remaining: 10,
                replacements_remaining: 3,
            }),
            quota_fetches: AtomicU32::new(0),
            target: Mutex::new(BoostTarget {
                item_id: 42,
                display_name: "stub".to_string(),
                tier: "A".to_string(),
                owners_count: 200,
                wanters_count: 50,
            }),
            replacement_advances: AtomicBool::new(true),
            owners: Mutex::new(Vec::new()),
            inventory: Mutex::new(Vec::new()),
            open_offers: Mutex::new(HashSet::new()),
            refuse_cancel: Mutex::new(HashSet::new()),
            next_offer: AtomicU64::new(1),
            completed_trades: AtomicU64::new(0),
        })
    }

    pub fn set_wants(&self, pairs: &[(u64, u32)]) {
        let mut wants = self.wants.lock().unwrap();
        for &(item, demand) in pairs {
            wants.insert(item, demand);
        }
    }

    pub fn fail_wants(&self, items: &[u64]) {
        let mut errors = self.want_errors.lock().unwrap();
        for &item in items {
            errors.insert(item);
        }
    }

    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn set_quota(&self, donations: u32, replacements: u32) {
        *self.quota.lock().unwrap() = QuotaSnapshot {
            donations_remaining: donations,
            replacements_remaining: replacements,
        };
    }

    pub fn set_target(&self, target: BoostTarget) {
        *self.target.lock().unwrap() = target;
    }

    pub fn current_target(&self) -> BoostTarget {
        self.target.lock().unwrap().clone()
    }

    pub fn set_owners(&self, owners: Vec<Owner>) {
        *self.owners.lock().unwrap() = owners;
    }

    pub fn open_offer(&self, id: &str) {
        self.open_offers.lock().unwrap().insert(id.to_string());
    }

    pub fn refuse_cancel_of(&self, id: &str) {
        self.refuse_cancel.lock().unwrap().insert(id.to_string());
    }

    pub fn open_offer_count(&self) -> usize {
        self.open_offers.lock().unwrap().len()
    }

    pub fn add_completed_trades(&self, n: u64) {
        self.completed_trades.fetch_add(n, Ordering::SeqCst);
    }

    pub fn set_inventory(&self, instances: Vec<InventoryInstance>) {
        *self.inventory.lock().unwrap() = instances;
    }

    /// Make the next token refresh bring the session back to life.
    pub fn refresh_restores_liveness(&self) {
        self.refresh_restores.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SiteSession for StubSite {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn refresh_token(&self) -> Result<bool, ApiError> {
        if self.refresh_restores.load(Ordering::SeqCst) {
            self.live.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(self.live.load(Ordering::SeqCst))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.live.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_target(&self) -> Result<BoostTarget, ApiError> {
        Ok(self.target.lock().unwrap().clone())
    }

    async fn fetch_quota(&self) -> Result<QuotaSnapshot, ApiError> {
        self.quota_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(*self.quota.lock().unwrap())
    }

    async fn count_wants(&self, item_id: u64) -> Result<u32, ApiError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.want_errors.lock().unwrap().contains(&item_id) {
            return Err(ApiError::Malformed(format!("no count for {}", item_id)));
        }
        self.wants
            .lock()
            .unwrap()
            .get(&item_id)
            .copied()
            .ok_or_else(|| ApiError::Malformed(format!("unknown card {}", item_id)))
    }

    async fn fetch_owners(&self, _item_id: u64) -> Result<Vec<Owner>, ApiError> {
        Ok(self.owners.lock().unwrap().clone())
    }

    async fn fetch_inventory(&self) -> Result<Vec<InventoryInstance>, ApiError> {
        Ok(self.inventory.lock().unwrap().clone())
    }

    async fn send_offer(
        &self,
        _owner: &Owner,
        _instance: &InventoryInstance,
    ) -> Result<OfferId, ApiError> {
        let n = self.next_offer.fetch_add(1, Ordering::SeqCst);
        let id = format!("offer-{}", n);
        self.open_offers.lock().unwrap().insert(id.clone());
        Ok(OfferId(id))
    }

    async fn cancel_offer(&self, offer: &OfferId) -> Result<(), ApiError> {
        if self.refuse_cancel.lock().unwrap().contains(&offer.0) {
            return Err(ApiError::Malformed("cancel refused".to_string()));
        }
        self.open_offers.lock().unwrap().remove(&offer.0);
        Ok(())
    }

    async fn outstanding_offers(&self) -> Result<Vec<OfferId>, ApiError> {
        Ok(self
            .open_offers
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(OfferId)
            .collect())
    }

    async fn completed_trade_count(&self) -> Result<u64, ApiError> {
        Ok(self.completed_trades.load(Ordering::SeqCst))
    }

    async fn submit_replacement(&self) -> Result<(), ApiError> {
        if self.replacement_advances.load(Ordering::SeqCst) {
            let mut target = self.target.lock().unwrap();
            target.item_id += 1;
            target.display_name = format!("stub-{}", target.item_id);
        }
        let mut quota = self.quota.lock().unwrap();
        quota.replacements_remaining = quota.replacements_remaining.saturating_sub(1);
        Ok(())
    }
}

/// Login factory that mints a fresh `StubSite` per call.
pub struct StubAuthenticator {
    logins: AtomicU32,
    sessions: Mutex<Vec<Arc<StubSite>>>,
}

impl StubAuthenticator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            logins: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn login_count(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn last_session(&self) -> Option<Arc<StubSite>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Authenticator for StubAuthenticator {
    async fn login(&self) -> Result<Arc<dyn SiteSession>, AuthError> {
        let site = StubSite::new();
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().push(site.clone());
        Ok(site)
    }
}
