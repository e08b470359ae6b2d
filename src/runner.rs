//! Orchestration loop
//!
//! The long-running state machine driving donation cycles: check quota,
//! reconsider the target, offer a card to every owner, wait for the boost
//! or a timeout, and sleep through the daily reset when donations run
//! out. Nothing in here is allowed to kill the loop except a re-login
//! that itself fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::api::{Authenticator, SiteSession};
use crate::config::BotConfig;
use crate::guard::{Recovery, SessionGuard};
use crate::inventory::InventoryStore;
use crate::poller::{HistoryPoller, TargetPoller};
use crate::quota::QuotaTracker;
use crate::replacement::{should_replace, ReplaceOutcome, Replacer};
use crate::selector::{Selector, SelectorConfig};
use crate::trade::OfferBook;
use crate::types::BoostTarget;

/// External stop signal. Triggered from the Ctrl-C handler; every
/// blocking wait in the loop races against it.
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Loop states, tracked for the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Authenticating,
    Ready,
    Cycling,
    WaitingForCompletion,
    Sleeping,
    Replacing,
    Terminal,
}

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Donation quota hit zero; the loop slept through the reset and
    /// rebuilt everything.
    SleptThroughReset,
    /// The target was replaced, forced or by policy.
    Replaced,
    /// The poller saw the target change; the cycle succeeded.
    TargetChanged,
    /// Offers were made but the wait timed out.
    TimedOut,
    /// No offers could be made this cycle.
    NoOffers,
    /// Offers were made and no poller is available to wait on.
    OffersInFlight,
    /// Transient condition; retry at the next cycle boundary.
    Skipped,
    Interrupted,
}

enum WaitOutcome {
    Changed,
    TimedOut,
    Interrupted,
}

pub struct App {
    cfg: BotConfig,
    guard: SessionGuard,
    session: Arc<dyn SiteSession>,
    store: InventoryStore,
    quota: QuotaTracker,
    selector: Selector,
    replacer: Replacer,
    offers: OfferBook,
    target_poller: Option<TargetPoller>,
    history_poller: Option<HistoryPoller>,
    target: BoostTarget,
    failed_cycles: u32,
    state: LoopState,
    shutdown: Arc<Shutdown>,
}

impl App {
    pub fn new(
        cfg: BotConfig,
        auth: Arc<dyn Authenticator>,
        session: Arc<dyn SiteSession>,
        store: InventoryStore,
        target: BoostTarget,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let quota = QuotaTracker::new(session.clone(), cfg.reset_utc_offset_hours);
        let selector = Selector::new(session.clone(), SelectorConfig::from(&cfg));
        let replacer = Replacer::new(session.clone(), &cfg);
        Self {
            guard: SessionGuard::new(auth),
            quota,
            selector,
            replacer,
            offers: OfferBook::new(),
            target_poller: None,
            history_poller: None,
            target,
            failed_cycles: 0,
            state: LoopState::Ready,
            session,
            store,
            cfg,
            shutdown,
        }
    }

    pub fn session(&self) -> &Arc<dyn SiteSession> {
        &self.session
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn replacer(&self) -> &Replacer {
        &self.replacer
    }

    pub fn offers(&self) -> &OfferBook {
        &self.offers
    }

    pub fn store(&self) -> &InventoryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut InventoryStore {
        &mut self.store
    }

    pub fn target(&self) -> &BoostTarget {
        &self.target
    }

    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            debug!("State: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Run cycles until interrupted or a terminal failure.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.set_state(LoopState::Cycling);
        if self.cfg.enable_pollers {
            self.start_pollers();
        }

        loop {
            if self.shutdown.is_triggered() {
                info!("Stop requested, leaving the loop");
                break;
            }
            match self.run_cycle().await? {
                CycleOutcome::Interrupted => break,
                CycleOutcome::TimedOut => {
                    // A timed-out wait restarts after a short pause; the
                    // other restarts go straight back in.
                    if self
                        .pause(Duration::from_secs(self.cfg.cycle_pause_secs))
                        .await
                    {
                        break;
                    }
                }
                CycleOutcome::Skipped => {
                    if self
                        .pause(Duration::from_secs(self.cfg.wait_check_interval_secs))
                        .await
                    {
                        break;
                    }
                }
                _ => {}
            }
        }

        self.stop_pollers().await;
        info!("Loop stopped cleanly");
        Ok(())
    }

    /// One pass of the per-cycle algorithm.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        // Everything below touches the network; recover the session
        // first if it died.
        match self.guard.ensure_live(&self.session).await {
            Ok(Recovery::Live) | Ok(Recovery::Refreshed) => {}
            Ok(Recovery::Replaced(fresh)) => self.rebuild_collaborators(fresh).await,
            Err(e) => {
                self.set_state(LoopState::Terminal);
                return Err(e).context("session recovery failed");
            }
        }

        // 1. Donation quota gate.
        let donations = match self.quota.donations_remaining(true).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Quota check failed: {}", e);
                return Ok(CycleOutcome::Skipped);
            }
        };
        if donations == 0 {
            return if self.sleep_until_reset().await? {
                Ok(CycleOutcome::SleptThroughReset)
            } else {
                Ok(CycleOutcome::Interrupted)
            };
        }

        // 2. The snapshot on disk wins, so an external process can swap
        // the target under us.
        if let Some(saved) = self.store.load_target().await {
            self.target = saved;
        }

        // 3. Too many empty cycles force a replacement regardless of the
        // policy. The counter resets either way so this never escalates
        // more than once per streak.
        if self.failed_cycles >= self.cfg.max_failed_cycles {
            warn!(
                "{} consecutive failed cycles, forcing a replacement",
                self.failed_cycles
            );
            self.set_state(LoopState::Replacing);
            let outcome = self
                .replacer
                .perform(
                    &mut self.quota,
                    &mut self.offers,
                    &self.target,
                    "forced after repeated failed cycles",
                )
                .await;
            self.set_state(LoopState::Cycling);
            self.failed_cycles = 0;
            match outcome {
                Ok(ReplaceOutcome::Replaced(new_target)) => {
                    self.adopt_target(new_target).await;
                    return Ok(CycleOutcome::Replaced);
                }
                Ok(other) => {
                    info!("Forced replacement yielded {:?}, keeping current target", other);
                }
                Err(e) => warn!("Forced replacement failed: {}", e),
            }
        }

        // 4. Policy check against live counts.
        match self.session.fetch_target().await {
            Ok(live) => {
                if live.item_id != self.target.item_id {
                    info!(
                        "Target changed between cycles: {} -> {}",
                        self.target.item_id, live.item_id
                    );
                    self.adopt_target(live).await;
                    self.failed_cycles = 0;
                    return Ok(CycleOutcome::TargetChanged);
                }
                self.target = live;
                if let Err(e) = self.store.save_target(&self.target).await {
                    warn!("Could not persist target snapshot: {}", e);
                }

                if should_replace(self.target.owners_count, self.target.wanters_count) {
                    self.set_state(LoopState::Replacing);
                    let outcome = self
                        .replacer
                        .perform(
                            &mut self.quota,
                            &mut self.offers,
                            &self.target,
                            "owner and demand counts favor a fresh target",
                        )
                        .await;
                    self.set_state(LoopState::Cycling);
                    match outcome {
                        Ok(ReplaceOutcome::Replaced(new_target)) => {
                            self.adopt_target(new_target).await;
                            self.failed_cycles = 0;
                            return Ok(CycleOutcome::Replaced);
                        }
                        Ok(other) => {
                            info!("Replacement yielded {:?}, continuing with current target", other);
                        }
                        Err(e) => warn!("Replacement failed: {}", e),
                    }
                }
            }
            Err(e) => warn!("Could not refresh target counts: {}", e),
        }

        // A change flag left over from an earlier cycle must not count
        // for this one.
        if let Some(poller) = &self.target_poller {
            poller.clear_changed();
        }

        // Accepted offers free nothing; prune them when the history
        // poller saw movement.
        if let Some(history) = &self.history_poller {
            if history.new_completions() {
                history.clear();
                self.offers.sync_completed(&self.session).await;
            }
        }

        // The quota may have drained while we were replacing.
        match self.quota.donations_remaining(true).await {
            Ok(0) => return Ok(CycleOutcome::Skipped),
            Ok(_) => {}
            Err(e) => {
                warn!("Quota check failed: {}", e);
                return Ok(CycleOutcome::Skipped);
            }
        }

        // 5. Offer one card to each owner.
        info!(
            "Processing target {} ({}, tier {}, {} wanters)",
            self.target.item_id, self.target.display_name, self.target.tier, self.target.wanters_count
        );
        let total = self.offer_round().await;

        // 6. A change seen while offering is already a success.
        if self.poller_saw_change() {
            info!("Boost happened during the round");
            self.failed_cycles = 0;
            self.refresh_target_after_change().await;
            return Ok(CycleOutcome::TargetChanged);
        }

        // 7. Offers out: wait for the boost or a timeout.
        if total > 0 {
            info!("Sent {} offers this cycle", total);
            if self.target_poller.as_ref().map_or(false, |p| p.is_running()) {
                self.set_state(LoopState::WaitingForCompletion);
                let outcome = self.wait_for_completion().await;
                self.set_state(LoopState::Cycling);
                match outcome {
                    WaitOutcome::Changed => {
                        self.failed_cycles = 0;
                        self.refresh_target_after_change().await;
                        return Ok(CycleOutcome::TargetChanged);
                    }
                    WaitOutcome::TimedOut => {
                        if !self.cfg.dry_run {
                            self.offers.cancel_all(&self.session).await;
                        }
                        self.failed_cycles += 1;
                        warn!(
                            "Cycle #{}/{} ended without a donation (wait timed out)",
                            self.failed_cycles, self.cfg.max_failed_cycles
                        );
                        return Ok(CycleOutcome::TimedOut);
                    }
                    WaitOutcome::Interrupted => return Ok(CycleOutcome::Interrupted),
                }
            }
            return Ok(CycleOutcome::OffersInFlight);
        }

        // 8. Nothing to offer: count the failure, restart immediately.
        self.failed_cycles += 1;
        warn!(
            "Cycle #{}/{} ended without a donation (no offers made)",
            self.failed_cycles, self.cfg.max_failed_cycles
        );
        Ok(CycleOutcome::NoOffers)
    }

    /// Offer a card to every owner of the current target. Returns how
    /// many offers went out.
    async fn offer_round(&mut self) -> usize {
        let owners = match self.session.fetch_owners(self.target.item_id).await {
            Ok(owners) => owners,
            Err(e) => {
                warn!("Owners fetch failed: {}", e);
                return 0;
            }
        };
        info!("{} owners hold target {}", owners.len(), self.target.item_id);

        let mut total = 0usize;
        let mut offered: HashSet<u64> = HashSet::new();

        for owner in owners {
            if self.shutdown.is_triggered() {
                break;
            }
            if self.poller_saw_change() {
                info!("Target changed mid-round, stopping offers");
                break;
            }
            if owner.user_id == self.cfg.user_id {
                continue;
            }

            let mut excluded = self.offers.unavailable();
            excluded.extend(offered.iter().copied());

            let pick = self
                .selector
                .select(
                    &mut self.store,
                    self.target.tier.as_str(),
                    self.target.wanters_count,
                    &excluded,
                )
                .await;
            let pick = match pick {
                Some(pick) => pick,
                None => {
                    debug!("No eligible card for owner {}", owner.user_id);
                    continue;
                }
            };

            if self.cfg.dry_run {
                info!(
                    "[dry-run] Would offer instance {} (demand {}) to {}",
                    pick.instance.instance_id, pick.demand, owner.username
                );
                offered.insert(pick.instance.instance_id);
                total += 1;
                continue;
            }

            match self.session.send_offer(&owner, &pick.instance).await {
                Ok(offer_id) => {
                    self.offers.record_sent(offer_id, &owner, &pick.instance);
                    offered.insert(pick.instance.instance_id);
                    total += 1;
                }
                Err(e) => warn!("Offer to {} failed: {}", owner.user_id, e),
            }
        }
        total
    }

    /// Poll until the target changes or the bounded wait runs out.
    async fn wait_for_completion(&self) -> WaitOutcome {
        let poller = match &self.target_poller {
            Some(poller) => poller,
            None => return WaitOutcome::TimedOut,
        };
        let timeout = Duration::from_secs(self.cfg.wait_after_all_owners_secs);
        let check = Duration::from_secs(self.cfg.wait_check_interval_secs.max(1));
        info!(
            "All owners processed, waiting up to {}m for the boost",
            timeout.as_secs() / 60
        );

        let deadline = Instant::now() + timeout;
        let mut checks = 0u32;
        loop {
            if poller.changed() {
                info!("Boost happened while waiting");
                return WaitOutcome::Changed;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Wait timed out after {}m", timeout.as_secs() / 60);
                return WaitOutcome::TimedOut;
            }
            checks += 1;
            if checks % 15 == 0 {
                debug!("Still waiting, {}s left", (deadline - now).as_secs());
            }
            tokio::select! {
                _ = sleep(check) => {}
                _ = self.shutdown.wait() => return WaitOutcome::Interrupted,
            }
        }
    }

    /// Tear everything down, sleep until the daily reset, then log back
    /// in and rebuild. Returns false when interrupted mid-sleep.
    async fn sleep_until_reset(&mut self) -> anyhow::Result<bool> {
        self.set_state(LoopState::Sleeping);
        warn!("Donation quota exhausted, sleeping until the daily reset");

        if !self.cfg.dry_run {
            self.offers.cancel_all(&self.session).await;
        }
        self.stop_pollers().await;
        if let Err(e) = self.session.logout().await {
            warn!("Logout failed: {}", e);
        }

        let total = self.quota.seconds_until_reset().max(0) as u64;
        self.quota.invalidate();
        info!("Reset in {}h {}m", total / 3600, (total % 3600) / 60);

        let step_len = self.cfg.sleep_check_interval_secs.max(1);
        let mut remaining = total;
        while remaining > 0 {
            if self.shutdown.is_triggered() {
                return Ok(false);
            }
            let minutes = (remaining % 3600) / 60;
            if minutes % 10 == 0 || remaining < 600 {
                debug!("Sleeping: {}h {}m until reset", remaining / 3600, minutes);
            }
            let step = remaining.min(step_len);
            tokio::select! {
                _ = sleep(Duration::from_secs(step)) => {}
                _ = self.shutdown.wait() => return Ok(false),
            }
            remaining -= step;
        }

        self.set_state(LoopState::Authenticating);
        info!("Daily reset passed, logging back in");
        let fresh = self
            .guard
            .authenticator()
            .login()
            .await
            .context("re-login after the daily reset failed")?;
        self.rebuild_collaborators(fresh).await;
        self.failed_cycles = 0;
        self.set_state(LoopState::Cycling);
        info!("Fully restarted after the reset");
        Ok(true)
    }

    /// Swap in a new session and rebuild everything that held the old
    /// one by reference. Skipping any collaborator here leaves it
    /// silently talking to a dead session.
    async fn rebuild_collaborators(&mut self, session: Arc<dyn SiteSession>) {
        info!("Rebuilding collaborators against the new session");
        self.session = session.clone();
        self.quota = QuotaTracker::new(session.clone(), self.cfg.reset_utc_offset_hours);
        self.selector = Selector::new(session.clone(), SelectorConfig::from(&self.cfg));
        self.replacer = Replacer::new(session.clone(), &self.cfg);

        match self.session.fetch_target().await {
            Ok(target) => {
                if let Err(e) = self.store.save_target(&target).await {
                    warn!("Could not persist target snapshot: {}", e);
                }
                self.target = target;
            }
            Err(e) => warn!("Could not reload target after rebuild: {}", e),
        }

        self.stop_pollers().await;
        if self.cfg.enable_pollers {
            self.start_pollers();
        }
    }

    pub fn start_pollers(&mut self) {
        if self.target_poller.is_none() {
            self.target_poller = Some(TargetPoller::start(
                self.session.clone(),
                Duration::from_secs(self.cfg.target_poll_interval_secs),
                self.target.item_id,
            ));
        }
        if self.history_poller.is_none() {
            self.history_poller = Some(HistoryPoller::start(
                self.session.clone(),
                Duration::from_secs(self.cfg.history_poll_interval_secs),
            ));
        }
    }

    pub async fn stop_pollers(&mut self) {
        if let Some(poller) = self.target_poller.take() {
            poller.stop().await;
        }
        if let Some(poller) = self.history_poller.take() {
            poller.stop().await;
        }
    }

    fn poller_saw_change(&self) -> bool {
        self.target_poller
            .as_ref()
            .map_or(false, |p| p.is_running() && p.changed())
    }

    /// Adopt the target the poller saw, preferring a fresh read for the
    /// counts.
    async fn refresh_target_after_change(&mut self) {
        if let Some(poller) = &self.target_poller {
            poller.clear_changed();
        }
        match self.session.fetch_target().await {
            Ok(target) => self.adopt_target(target).await,
            Err(e) => warn!("Could not load the new target yet: {}", e),
        }
    }

    async fn adopt_target(&mut self, target: BoostTarget) {
        if let Some(poller) = &self.target_poller {
            poller.set_current_id(target.item_id);
        }
        if let Err(e) = self.store.save_target(&target).await {
            warn!("Could not persist target snapshot: {}", e);
        }
        info!(
            "Now working target {} ({}, tier {})",
            target.item_id, target.display_name, target.tier
        );
        self.target = target;
    }

    /// Interruptible pause. Returns true when the stop signal fired.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = self.shutdown.wait() => true,
        }
    }
}
