//! Boost-target replacement
//!
//! A target with few owners is slow to complete, and one with many owners
//! is only worth keeping while demand is high. `should_replace` encodes
//! the owner-count bands; `Replacer` carries out the swap and verifies it
//! actually happened.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::api::SiteSession;
use crate::config::BotConfig;
use crate::error::ApiError;
use crate::quota::QuotaTracker;
use crate::trade::OfferBook;
use crate::types::BoostTarget;

/// Pure replacement decision over the target's live counts.
pub fn should_replace(owners_count: u32, wanters_count: u32) -> bool {
    match owners_count {
        0 => false,
        1..=108 => true,
        109..=216 => wanters_count >= 121,
        217..=360 => wanters_count >= 181,
        361..=540 => wanters_count >= 300,
        _ => false,
    }
}

/// How a replacement attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    Replaced(BoostTarget),
    /// No replacements left today.
    QuotaExhausted,
    /// The service accepted the request but handed back the same card.
    NoOp,
}

pub struct Replacer {
    session: Arc<dyn SiteSession>,
    cancel_pause: Duration,
    settle: Duration,
}

impl Replacer {
    pub fn new(session: Arc<dyn SiteSession>, cfg: &BotConfig) -> Self {
        Self {
            session,
            cancel_pause: Duration::from_secs(cfg.cancel_pause_secs),
            settle: Duration::from_secs(cfg.replace_settle_secs),
        }
    }

    pub fn session(&self) -> &Arc<dyn SiteSession> {
        &self.session
    }

    /// Replace the current target.
    ///
    /// Outstanding offers are cancelled first: an offer referencing the
    /// abandoned target becomes invalid and must not linger. After the
    /// swap settles, the target is reloaded and its identity compared;
    /// the same card coming back is reported as `NoOp`, never retried
    /// here.
    pub async fn perform(
        &self,
        quota: &mut QuotaTracker,
        offers: &mut OfferBook,
        current: &BoostTarget,
        reason: &str,
    ) -> Result<ReplaceOutcome, ApiError> {
        info!(
            "Replacing target {} ({}, {} owners, {} wanters): {}",
            current.item_id,
            current.display_name,
            current.owners_count,
            current.wanters_count,
            reason
        );

        if quota.replacements_remaining(true).await? == 0 {
            warn!("Replacement quota exhausted");
            return Ok(ReplaceOutcome::QuotaExhausted);
        }

        offers.cancel_all(&self.session).await;
        sleep(self.cancel_pause).await;

        // The quota may have moved while offers were being torn down.
        if quota.replacements_remaining(true).await? == 0 {
            warn!("Replacement quota exhausted before submit");
            return Ok(ReplaceOutcome::QuotaExhausted);
        }

        self.session.submit_replacement().await?;
        sleep(self.settle).await;

        quota.invalidate();
        quota.replacements_remaining(true).await?;

        let new_target = self.session.fetch_target().await?;
        if new_target.item_id == current.item_id {
            warn!(
                "Replacement was a no-op, target {} unchanged",
                current.item_id
            );
            return Ok(ReplaceOutcome::NoOp);
        }

        info!(
            "Target replaced: {} ({}) -> {} ({})",
            current.item_id, current.display_name, new_target.item_id, new_target.display_name
        );
        Ok(ReplaceOutcome::Replaced(new_target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubSite;

    #[test]
    fn low_owner_band_always_replaces() {
        assert!(should_replace(1, 0));
        assert!(should_replace(50, 0));
        assert!(should_replace(107, 0));
        assert!(should_replace(108, 0));
    }

    #[test]
    fn second_band_needs_121_wanters() {
        assert!(!should_replace(109, 120));
        assert!(should_replace(109, 121));
        assert!(!should_replace(216, 120));
        assert!(should_replace(216, 121));
    }

    #[test]
    fn third_band_needs_181_wanters() {
        assert!(!should_replace(217, 180));
        assert!(should_replace(217, 181));
        assert!(!should_replace(360, 180));
        assert!(should_replace(360, 181));
    }

    #[test]
    fn fourth_band_needs_300_wanters() {
        assert!(!should_replace(361, 299));
        assert!(should_replace(361, 300));
        assert!(!should_replace(540, 299));
        assert!(should_replace(540, 300));
    }

    #[test]
    fn zero_and_oversized_owner_counts_never_replace() {
        assert!(!should_replace(0, 10_000));
        assert!(!should_replace(541, 10_000));
        assert!(!should_replace(9_999, 10_000));
    }

    fn test_cfg() -> BotConfig {
        BotConfig {
            cancel_pause_secs: 0,
            replace_settle_secs: 0,
            ..BotConfig::default()
        }
    }

    #[tokio::test]
    async fn replaced_when_identity_changes() {
        let site = StubSite::new();
        site.set_quota(10, 2);
        let old = site.current_target();

        let replacer = Replacer::new(site.clone(), &test_cfg());
        let mut quota = QuotaTracker::new(site.clone(), 3);
        let mut offers = OfferBook::new();

        let outcome = replacer
            .perform(&mut quota, &mut offers, &old, "test")
            .await
            .unwrap();
        match outcome {
            ReplaceOutcome::Replaced(new_target) => {
                assert_ne!(new_target.item_id, old.item_id);
            }
            other => panic!("expected Replaced, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn same_identity_reports_noop() {
        let site = StubSite::new();
        site.set_quota(10, 2);
        site.replacement_advances
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let old = site.current_target();

        let replacer = Replacer::new(site.clone(), &test_cfg());
        let mut quota = QuotaTracker::new(site.clone(), 3);
        let mut offers = OfferBook::new();

        let outcome = replacer
            .perform(&mut quota, &mut offers, &old, "test")
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::NoOp);
    }

    #[tokio::test]
    async fn exhausted_quota_aborts_before_submit() {
        let site = StubSite::new();
        site.set_quota(10, 0);
        let old = site.current_target();

        let replacer = Replacer::new(site.clone(), &test_cfg());
        let mut quota = QuotaTracker::new(site.clone(), 3);
        let mut offers = OfferBook::new();

        let outcome = replacer
            .perform(&mut quota, &mut offers, &old, "test")
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::QuotaExhausted);
        // Target untouched.
        assert_eq!(site.current_target().item_id, old.item_id);
    }

    #[tokio::test]
    async fn replacement_cancels_outstanding_offers_first() {
        let site = StubSite::new();
        site.set_quota(10, 2);
        site.open_offer("o1");
        let old = site.current_target();

        let replacer = Replacer::new(site.clone(), &test_cfg());
        let mut quota = QuotaTracker::new(site.clone(), 3);
        let mut offers = OfferBook::new();
        offers.record_sent(
            crate::types::OfferId("o1".to_string()),
            &crate::types::Owner {
                user_id: 5,
                username: "ann".to_string(),
            },
            &crate::types::InventoryInstance {
                instance_id: 900,
                item_id: 100,
                tier: "A".to_string(),
            },
        );

        replacer
            .perform(&mut quota, &mut offers, &old, "test")
            .await
            .unwrap();
        assert_eq!(site.open_offer_count(), 0);
        assert_eq!(offers.sent_count(), 0);
    }
}
