//! Session liveness guard
//!
//! Every state-machine step that touches the network runs behind this
//! check. Recovery is two-tier: a silent token refresh first, then a full
//! re-login. A re-login hands back a brand new session, and the caller
//! must rebuild every collaborator that held the old one by reference.

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::{Authenticator, SiteSession};
use crate::error::AuthError;

/// Result of a liveness check.
pub enum Recovery {
    /// Session was fine, nothing happened.
    Live,
    /// The existing session was restored in place.
    Refreshed,
    /// A full re-login produced this new session; collaborators holding
    /// the old one must be rebuilt.
    Replaced(Arc<dyn SiteSession>),
}

pub struct SessionGuard {
    auth: Arc<dyn Authenticator>,
}

impl SessionGuard {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self { auth }
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    /// Make sure `session` is usable, recovering if it is not.
    ///
    /// Errors only when the full re-login itself fails; that is the one
    /// unrecoverable condition and the caller surfaces it as terminal.
    pub async fn ensure_live(
        &self,
        session: &Arc<dyn SiteSession>,
    ) -> Result<Recovery, AuthError> {
        if session.is_live() {
            return Ok(Recovery::Live);
        }
        warn!("Session marker missing, attempting token refresh");

        match session.refresh_token().await {
            Ok(true) if session.is_live() => {
                info!("Session restored in place");
                return Ok(Recovery::Refreshed);
            }
            Ok(_) => {}
            Err(e) => warn!("Token refresh failed: {}", e),
        }

        warn!("Refresh did not restore the session, performing full re-login");
        let fresh = self.auth.login().await?;
        info!("Re-login succeeded, collaborators must be rebuilt");
        Ok(Recovery::Replaced(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubAuthenticator, StubSite};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn live_session_passes_through() {
        let site = StubSite::new();
        let auth = StubAuthenticator::new();
        let guard = SessionGuard::new(auth.clone());

        let session: Arc<dyn SiteSession> = site;
        assert!(matches!(
            guard.ensure_live(&session).await.unwrap(),
            Recovery::Live
        ));
        assert_eq!(auth.login_count(), 0);
    }

    #[tokio::test]
    async fn dead_refreshable_session_is_restored_in_place() {
        let site = StubSite::new();
        site.live.store(false, Ordering::SeqCst);
        site.refresh_restores_liveness();
        let auth = StubAuthenticator::new();
        let guard = SessionGuard::new(auth.clone());

        let session: Arc<dyn SiteSession> = site;
        assert!(matches!(
            guard.ensure_live(&session).await.unwrap(),
            Recovery::Refreshed
        ));
        assert_eq!(auth.login_count(), 0);
    }

    #[tokio::test]
    async fn unrefreshable_session_is_replaced() {
        let site = StubSite::new();
        site.live.store(false, Ordering::SeqCst);
        let auth = StubAuthenticator::new();
        let guard = SessionGuard::new(auth.clone());

        let session: Arc<dyn SiteSession> = site;
        match guard.ensure_live(&session).await.unwrap() {
            Recovery::Replaced(fresh) => assert!(fresh.is_live()),
            _ => panic!("expected Replaced"),
        }
        assert_eq!(auth.login_count(), 1);
    }
}
