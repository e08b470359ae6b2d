//! Cycle-level behavior of the orchestration loop: failure counting,
//! replacement triggers, and the bounded completion wait.

use std::sync::Arc;
use std::time::Duration;

use boost_runner::runner::{App, CycleOutcome, Shutdown};
use boost_runner::test_support::{StubAuthenticator, StubSite};
use boost_runner::types::{BoostTarget, InventoryInstance, Owner};
use boost_runner::{Authenticator, BotConfig, InventoryStore};

fn target(item_id: u64, owners: u32, wanters: u32) -> BoostTarget {
    BoostTarget {
        item_id,
        display_name: format!("card-{}", item_id),
        tier: "A".to_string(),
        owners_count: owners,
        wanters_count: wanters,
    }
}

fn instance(instance_id: u64, item_id: u64) -> InventoryInstance {
    InventoryInstance {
        instance_id,
        item_id,
        tier: "A".to_string(),
    }
}

fn owner(user_id: u64) -> Owner {
    Owner {
        user_id,
        username: format!("user-{}", user_id),
    }
}

/// App over a stub site whose target never trips the replacement policy.
async fn quiet_app(
    auth: &Arc<StubAuthenticator>,
    dir: &tempfile::TempDir,
    enable_pollers: bool,
) -> (App, Arc<StubSite>) {
    let session = auth.login().await.unwrap();
    let site = auth.last_session().unwrap();
    // 600 owners sits outside every replacement band.
    site.set_target(target(42, 600, 50));
    let store = InventoryStore::open(dir.path(), 24).await.unwrap();
    let cfg = BotConfig {
        enable_pollers,
        user_id: 1,
        ..BotConfig::default()
    };
    let app = App::new(
        cfg,
        auth.clone(),
        session,
        store,
        site.current_target(),
        Shutdown::new(),
    );
    (app, site)
}

#[tokio::test(start_paused = true)]
async fn empty_cycles_count_failures() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, _site) = quiet_app(&auth, &dir, false).await;

    for expected in 1..=2 {
        let outcome = app.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoOffers);
        assert_eq!(app.failed_cycles(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn target_change_between_cycles_resets_failures() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, site) = quiet_app(&auth, &dir, false).await;

    app.run_cycle().await.unwrap();
    assert_eq!(app.failed_cycles(), 1);

    site.set_target(target(99, 600, 50));
    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::TargetChanged);
    assert_eq!(app.failed_cycles(), 0);
    assert_eq!(app.target().item_id, 99);
}

#[tokio::test(start_paused = true)]
async fn policy_replacement_runs_and_resets_failures() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, site) = quiet_app(&auth, &dir, false).await;

    app.run_cycle().await.unwrap();
    assert_eq!(app.failed_cycles(), 1);

    // Same identity, but now inside the always-replace band.
    site.set_target(target(42, 50, 0));
    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replaced);
    assert_eq!(app.failed_cycles(), 0);
    assert_ne!(app.target().item_id, 42);
}

#[tokio::test(start_paused = true)]
async fn policy_noop_replacement_is_not_a_success() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, site) = quiet_app(&auth, &dir, false).await;

    site.set_target(target(42, 50, 0));
    site.replacement_advances
        .store(false, std::sync::atomic::Ordering::SeqCst);

    let outcome = app.run_cycle().await.unwrap();
    // The service returned the same card; the cycle carries on and ends
    // without offers instead of claiming a replacement.
    assert_eq!(outcome, CycleOutcome::NoOffers);
    assert_eq!(app.target().item_id, 42);
}

#[tokio::test(start_paused = true)]
async fn third_failed_cycle_forces_replacement() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, _site) = quiet_app(&auth, &dir, false).await;

    for _ in 0..3 {
        assert_eq!(app.run_cycle().await.unwrap(), CycleOutcome::NoOffers);
    }
    assert_eq!(app.failed_cycles(), 3);

    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replaced);
    assert_eq!(app.failed_cycles(), 0);
    assert_ne!(app.target().item_id, 42);
}

#[tokio::test(start_paused = true)]
async fn failed_forced_replacement_still_resets_the_counter() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, site) = quiet_app(&auth, &dir, false).await;
    site.set_quota(10, 0);

    for _ in 0..3 {
        app.run_cycle().await.unwrap();
    }
    assert_eq!(app.failed_cycles(), 3);

    // Replacement quota is gone, so the forced attempt fails, but the
    // counter still resets and the cycle continues with the old target.
    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoOffers);
    assert_eq!(app.failed_cycles(), 1);
    assert_eq!(app.target().item_id, 42);
}

#[tokio::test(start_paused = true)]
async fn timed_out_wait_cancels_offers_and_counts_a_failure() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, site) = quiet_app(&auth, &dir, true).await;
    site.set_owners(vec![owner(5)]);
    site.set_wants(&[(700, 3)]);
    app.store_mut().replace_instances(vec![instance(9000, 700)]);

    app.start_pollers();
    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::TimedOut);
    assert_eq!(app.failed_cycles(), 1);
    // The timed-out offers were cancelled and their locks released.
    assert_eq!(site.open_offer_count(), 0);
    assert_eq!(app.offers().sent_count(), 0);
    app.stop_pollers().await;
}

#[tokio::test(start_paused = true)]
async fn boost_during_wait_succeeds_and_resets_failures() {
    let auth = StubAuthenticator::new();
    let dir = tempfile::tempdir().unwrap();
    let (mut app, site) = quiet_app(&auth, &dir, true).await;

    // One failure on the books first.
    assert_eq!(app.run_cycle().await.unwrap(), CycleOutcome::NoOffers);
    assert_eq!(app.failed_cycles(), 1);

    site.set_owners(vec![owner(5)]);
    site.set_wants(&[(700, 3)]);
    app.store_mut().replace_instances(vec![instance(9000, 700)]);
    app.start_pollers();

    // The boost lands a minute into the wait.
    let changer = site.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        changer.set_target(target(77, 600, 40));
    });

    let outcome = app.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::TargetChanged);
    assert_eq!(app.failed_cycles(), 0);
    assert_eq!(app.target().item_id, 77);
    app.stop_pollers().await;
}
