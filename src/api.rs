//! Service trait seams
//!
//! The loop, selector, quota tracker and pollers all talk to the card
//! service through `SiteSession`, and obtain sessions through
//! `Authenticator`. Both are object safe so tests can run the whole
//! machine against an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ApiError, AuthError};
use crate::types::{BoostTarget, InventoryInstance, OfferId, Owner, QuotaSnapshot};

/// An authenticated connection to the card service.
#[async_trait]
pub trait SiteSession: Send + Sync {
    /// Whether the session still carries its liveness marker.
    fn is_live(&self) -> bool;

    /// Lightweight in-place token refresh. `Ok(true)` means the session
    /// was restored without a full re-login.
    async fn refresh_token(&self) -> Result<bool, ApiError>;

    async fn logout(&self) -> Result<(), ApiError>;

    /// Current boost target with live owner and demand counts.
    async fn fetch_target(&self) -> Result<BoostTarget, ApiError>;

    /// Remaining daily quotas, read from the source of truth.
    async fn fetch_quota(&self) -> Result<QuotaSnapshot, ApiError>;

    /// How many accounts currently want the given card type.
    async fn count_wants(&self, item_id: u64) -> Result<u32, ApiError>;

    /// Counterparties holding the given card type.
    async fn fetch_owners(&self, item_id: u64) -> Result<Vec<Owner>, ApiError>;

    /// The operating account's tradable card instances.
    async fn fetch_inventory(&self) -> Result<Vec<InventoryInstance>, ApiError>;

    /// Offer one of our instances to an owner. Returns the server-side
    /// offer id.
    async fn send_offer(
        &self,
        owner: &Owner,
        instance: &InventoryInstance,
    ) -> Result<OfferId, ApiError>;

    async fn cancel_offer(&self, offer: &OfferId) -> Result<(), ApiError>;

    /// Ids of our offers still open on the server.
    async fn outstanding_offers(&self) -> Result<Vec<OfferId>, ApiError>;

    /// Total completed trades on the account's history page.
    async fn completed_trade_count(&self) -> Result<u64, ApiError>;

    /// Ask the club to swap the boost target for a new card.
    async fn submit_replacement(&self) -> Result<(), ApiError>;
}

/// Login factory producing fresh sessions.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<Arc<dyn SiteSession>, AuthError>;
}
