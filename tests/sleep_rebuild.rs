//! Quota-exhaustion scenario: the loop must tear down, sleep through the
//! daily reset, re-authenticate, and rebuild every collaborator against
//! the new session.

use std::sync::Arc;
use std::time::Duration;

use boost_runner::runner::{App, CycleOutcome, Shutdown};
use boost_runner::test_support::{StubAuthenticator, StubSite};
use boost_runner::{Authenticator, BotConfig, InventoryStore, SiteSession};

fn same_session(a: &Arc<dyn SiteSession>, b: &Arc<StubSite>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

async fn build_app(
    auth: &Arc<StubAuthenticator>,
    dir: &tempfile::TempDir,
    shutdown: Arc<Shutdown>,
) -> (App, Arc<StubSite>) {
    let session = auth.login().await.unwrap();
    let site = auth.last_session().unwrap();
    let store = InventoryStore::open(dir.path(), 24).await.unwrap();
    let target = site.current_target();
    let cfg = BotConfig {
        enable_pollers: false,
        ..BotConfig::default()
    };
    let app = App::new(cfg, auth.clone(), session, store, target, shutdown);
    (app, site)
}

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_sleeps_reauths_and_rebuilds() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, first) = build_app(&auth, &dir, Shutdown::new()).await;
    first.set_quota(0, 3);

    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::SleptThroughReset);

    // A second login happened after the sleep.
    assert_eq!(auth.login_count(), 2);
    let second = auth.last_session().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    // Every collaborator references the new session, not the old one.
    assert!(same_session(app.session(), &second));
    assert!(same_session(app.quota().session(), &second));
    assert!(same_session(app.selector().session(), &second));
    assert!(same_session(app.replacer().session(), &second));
    assert!(!same_session(app.session(), &first));

    assert_eq!(app.failed_cycles(), 0);
    // The old session was logged out on the way down.
    assert!(!first.is_live());

    // The next cycle runs normally against the fresh quota.
    let outcome = app.run_cycle().await.unwrap();
    assert_ne!(outcome, CycleOutcome::SleptThroughReset);
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_sleep_exits_cleanly() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();
    let (mut app, first) = build_app(&auth, &dir, shutdown.clone()).await;
    first.set_quota(0, 3);

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(90)).await;
        trigger.trigger();
    });

    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Interrupted);
    // No re-login happened; the interrupt won.
    assert_eq!(auth.login_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dead_session_is_replaced_and_collaborators_follow() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, first) = build_app(&auth, &dir, Shutdown::new()).await;

    // Kill the session under the loop; the refresh will not help.
    first.live.store(false, std::sync::atomic::Ordering::SeqCst);

    let outcome = app.run_cycle().await.unwrap();
    // The cycle itself proceeds after recovery.
    assert_ne!(outcome, CycleOutcome::Interrupted);

    assert_eq!(auth.login_count(), 2);
    let second = auth.last_session().unwrap();
    assert!(same_session(app.session(), &second));
    assert!(same_session(app.quota().session(), &second));
    assert!(same_session(app.selector().session(), &second));
}
