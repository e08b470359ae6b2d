//! Daily quota tracking
//!
//! Two independent counters, donations and target replacements, refreshed
//! from the service on demand. The reset clock is local: the service
//! resets both counters at midnight in a fixed-offset zone.

use std::sync::Arc;

use chrono::{FixedOffset, Offset, Timelike, Utc};
use tracing::debug;

use crate::api::SiteSession;
use crate::error::ApiError;
use crate::types::QuotaSnapshot;

const SECS_PER_DAY: i64 = 86_400;

pub struct QuotaTracker {
    session: Arc<dyn SiteSession>,
    reset_offset_hours: i32,
    snapshot: Option<QuotaSnapshot>,
}

impl QuotaTracker {
    pub fn new(session: Arc<dyn SiteSession>, reset_offset_hours: i32) -> Self {
        Self {
            session,
            reset_offset_hours,
            snapshot: None,
        }
    }

    /// The session this tracker reads from.
    pub fn session(&self) -> &Arc<dyn SiteSession> {
        &self.session
    }

    async fn snapshot(&mut self, refresh: bool) -> Result<QuotaSnapshot, ApiError> {
        if refresh || self.snapshot.is_none() {
            let fresh = self.session.fetch_quota().await?;
            debug!(
                "Quota refreshed: {} donations, {} replacements left",
                fresh.donations_remaining, fresh.replacements_remaining
            );
            self.snapshot = Some(fresh);
        }
        Ok(self.snapshot.unwrap_or(QuotaSnapshot {
            donations_remaining: 0,
            replacements_remaining: 0,
        }))
    }

    pub async fn donations_remaining(&mut self, refresh: bool) -> Result<u32, ApiError> {
        Ok(self.snapshot(refresh).await?.donations_remaining)
    }

    pub async fn replacements_remaining(&mut self, refresh: bool) -> Result<u32, ApiError> {
        Ok(self.snapshot(refresh).await?.replacements_remaining)
    }

    /// Drop the cached snapshot. Called before a sleep period so nothing
    /// stale survives the reset boundary.
    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }

    /// Seconds until the next daily reset in the service's zone.
    pub fn seconds_until_reset(&self) -> i64 {
        let offset =
            FixedOffset::east_opt(self.reset_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        let now = Utc::now().with_timezone(&offset);
        let since_midnight = now.num_seconds_from_midnight() as i64;
        SECS_PER_DAY - since_midnight
    }
}
