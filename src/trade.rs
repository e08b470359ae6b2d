//! Outstanding-offer bookkeeping
//!
//! Tracks every offer this account has in flight, the inventory instances
//! those offers reserve, and the instances already given away. Because a
//! lost response can leave an offer open server-side, teardown re-reads
//! the service's outgoing-offers page and reconciles against it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::SiteSession;
use crate::types::{InventoryInstance, OfferId, Owner};

/// One offer we sent and have not yet seen resolved.
#[derive(Debug, Clone)]
pub struct SentOffer {
    /// Client-side id tagging this send attempt.
    pub attempt_id: Uuid,
    pub offer_id: OfferId,
    pub owner_id: u64,
    pub instance_id: u64,
    pub sent_at: DateTime<Utc>,
}

/// Sent offers plus the instance locks they hold.
#[derive(Default)]
pub struct OfferBook {
    sent: Vec<SentOffer>,
    locked: HashSet<u64>,
    consumed: HashSet<u64>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent offer, locking its instance.
    pub fn record_sent(&mut self, offer_id: OfferId, owner: &Owner, instance: &InventoryInstance) {
        self.locked.insert(instance.instance_id);
        let offer = SentOffer {
            attempt_id: Uuid::new_v4(),
            offer_id,
            owner_id: owner.user_id,
            instance_id: instance.instance_id,
            sent_at: Utc::now(),
        };
        debug!(
            "Offer {} sent to {} with instance {} (attempt {})",
            offer.offer_id, owner.user_id, instance.instance_id, offer.attempt_id
        );
        self.sent.push(offer);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Instances that must not be selected: reserved by an in-flight
    /// offer, or already given away.
    pub fn unavailable(&self) -> HashSet<u64> {
        self.locked.union(&self.consumed).copied().collect()
    }

    pub fn is_consumed(&self, instance_id: u64) -> bool {
        self.consumed.contains(&instance_id)
    }

    /// Cancel every in-flight offer, then reconcile against the server's
    /// outgoing-offers page. Offers still open after one retry keep their
    /// locks; everything else is released for reuse.
    ///
    /// Returns the number of offers confirmed gone.
    pub async fn cancel_all(&mut self, session: &Arc<dyn SiteSession>) -> usize {
        if self.sent.is_empty() {
            return 0;
        }
        info!("Cancelling {} outstanding offers", self.sent.len());

        for offer in &self.sent {
            if let Err(e) = session.cancel_offer(&offer.offer_id).await {
                warn!("Cancel of offer {} failed: {}", offer.offer_id, e);
            }
        }

        let mut open = match session.outstanding_offers().await {
            Ok(ids) => ids.into_iter().collect::<HashSet<_>>(),
            Err(e) => {
                warn!("Could not read outstanding offers: {}", e);
                // Without server-side truth, keep every lock in place.
                return 0;
            }
        };

        // One retry for anything the first pass missed.
        for offer in &self.sent {
            if open.contains(&offer.offer_id) {
                match session.cancel_offer(&offer.offer_id).await {
                    Ok(()) => {
                        open.remove(&offer.offer_id);
                    }
                    Err(e) => warn!("Retry cancel of offer {} failed: {}", offer.offer_id, e),
                }
            }
        }

        let before = self.sent.len();
        let mut kept = Vec::new();
        for offer in self.sent.drain(..) {
            if open.contains(&offer.offer_id) {
                kept.push(offer);
            } else {
                self.locked.remove(&offer.instance_id);
            }
        }
        self.sent = kept;

        let cancelled = before - self.sent.len();
        if self.sent.is_empty() {
            info!("All offers cancelled");
        } else {
            warn!("{} offers still open after cancel pass", self.sent.len());
        }
        cancelled
    }

    /// Reconcile with the server after the history poller saw new
    /// completed trades. Offers that vanished without a cancel were
    /// accepted: their instances are gone for good.
    pub async fn sync_completed(&mut self, session: &Arc<dyn SiteSession>) {
        if self.sent.is_empty() {
            return;
        }
        let open = match session.outstanding_offers().await {
            Ok(ids) => ids.into_iter().collect::<HashSet<_>>(),
            Err(e) => {
                warn!("Could not read outstanding offers: {}", e);
                return;
            }
        };

        let mut kept = Vec::new();
        for offer in self.sent.drain(..) {
            if open.contains(&offer.offer_id) {
                kept.push(offer);
            } else {
                info!(
                    "Offer {} accepted, instance {} consumed",
                    offer.offer_id, offer.instance_id
                );
                self.locked.remove(&offer.instance_id);
                self.consumed.insert(offer.instance_id);
            }
        }
        self.sent = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubSite;

    fn owner(user_id: u64) -> Owner {
        Owner {
            user_id,
            username: format!("user-{}", user_id),
        }
    }

    fn instance(instance_id: u64) -> InventoryInstance {
        InventoryInstance {
            instance_id,
            item_id: 100,
            tier: "A".to_string(),
        }
    }

    #[tokio::test]
    async fn cancel_all_releases_confirmed_locks() {
        let site = StubSite::new();
        site.open_offer("o1");
        site.open_offer("o2");
        let session: Arc<dyn SiteSession> = site.clone();

        let mut book = OfferBook::new();
        book.record_sent(OfferId("o1".to_string()), &owner(5), &instance(900));
        book.record_sent(OfferId("o2".to_string()), &owner(6), &instance(901));
        assert_eq!(book.unavailable().len(), 2);

        let cancelled = book.cancel_all(&session).await;
        assert_eq!(cancelled, 2);
        assert!(book.unavailable().is_empty());
        assert_eq!(book.sent_count(), 0);
        assert_eq!(site.open_offer_count(), 0);
    }

    #[tokio::test]
    async fn stubborn_offer_keeps_its_lock() {
        let site = StubSite::new();
        site.open_offer("o1");
        site.open_offer("o2");
        site.refuse_cancel_of("o2");
        let session: Arc<dyn SiteSession> = site.clone();

        let mut book = OfferBook::new();
        book.record_sent(OfferId("o1".to_string()), &owner(5), &instance(900));
        book.record_sent(OfferId("o2".to_string()), &owner(6), &instance(901));

        let cancelled = book.cancel_all(&session).await;
        assert_eq!(cancelled, 1);
        assert_eq!(book.sent_count(), 1);
        assert!(book.unavailable().contains(&901));
        assert!(!book.unavailable().contains(&900));
    }

    #[tokio::test]
    async fn accepted_offer_consumes_instance() {
        // Offer o1 vanished from the server without us cancelling it.
        let site = StubSite::new();
        site.open_offer("o2");
        let session: Arc<dyn SiteSession> = site;

        let mut book = OfferBook::new();
        book.record_sent(OfferId("o1".to_string()), &owner(5), &instance(900));
        book.record_sent(OfferId("o2".to_string()), &owner(6), &instance(901));

        book.sync_completed(&session).await;
        assert!(book.is_consumed(900));
        assert!(book.unavailable().contains(&900));
        assert_eq!(book.sent_count(), 1);
    }
}
