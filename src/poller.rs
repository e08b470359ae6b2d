//! Background pollers
//!
//! Two watcher tasks run beside the control loop: one samples the club
//! page for a change of boost target, one samples the trade history for
//! newly completed trades. Each communicates through shared flags that
//! the loop reads and clears; single writer, single reader, coarse
//! polling, so a one-interval-late read is expected and fine. Stopping is
//! cooperative: the task exits itself at the next wakeup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::api::SiteSession;

const UNSET: u64 = u64::MAX;

struct Flags {
    stop: AtomicBool,
    running: AtomicBool,
    changed: AtomicBool,
    current: AtomicU64,
    wake: Notify,
}

impl Flags {
    fn new(initial: u64) -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            changed: AtomicBool::new(false),
            current: AtomicU64::new(initial),
            wake: Notify::new(),
        })
    }
}

/// Watches the club page for the boost target changing identity.
pub struct TargetPoller {
    flags: Arc<Flags>,
    handle: JoinHandle<()>,
}

impl TargetPoller {
    pub fn start(
        session: Arc<dyn SiteSession>,
        poll_interval: Duration,
        initial_id: u64,
    ) -> Self {
        let flags = Flags::new(initial_id);
        let task_flags = flags.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_flags.wake.notified() => {}
                }
                if task_flags.stop.load(Ordering::SeqCst) {
                    break;
                }
                match session.fetch_target().await {
                    Ok(target) => {
                        let prev = task_flags.current.load(Ordering::SeqCst);
                        if target.item_id != prev {
                            info!(
                                "Boost target changed: {} -> {} ({})",
                                prev, target.item_id, target.display_name
                            );
                            task_flags.current.store(target.item_id, Ordering::SeqCst);
                            task_flags.changed.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => debug!("Target poll failed: {}", e),
                }
            }
            task_flags.running.store(false, Ordering::SeqCst);
        });
        Self { flags, handle }
    }

    pub fn changed(&self) -> bool {
        self.flags.changed.load(Ordering::SeqCst)
    }

    pub fn clear_changed(&self) {
        self.flags.changed.store(false, Ordering::SeqCst);
    }

    pub fn current_id(&self) -> u64 {
        self.flags.current.load(Ordering::SeqCst)
    }

    /// Re-point the poller after a replacement so the new target does not
    /// read as a change.
    pub fn set_current_id(&self, item_id: u64) {
        self.flags.current.store(item_id, Ordering::SeqCst);
        self.flags.changed.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        self.flags.wake.notify_waiters();
        let _ = self.handle.await;
    }
}

/// Watches the trade history for newly completed trades.
pub struct HistoryPoller {
    flags: Arc<Flags>,
    handle: JoinHandle<()>,
}

impl HistoryPoller {
    pub fn start(session: Arc<dyn SiteSession>, poll_interval: Duration) -> Self {
        let flags = Flags::new(UNSET);
        let task_flags = flags.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_flags.wake.notified() => {}
                }
                if task_flags.stop.load(Ordering::SeqCst) {
                    break;
                }
                match session.completed_trade_count().await {
                    Ok(total) => {
                        let prev = task_flags.current.load(Ordering::SeqCst);
                        if prev == UNSET {
                            task_flags.current.store(total, Ordering::SeqCst);
                        } else if total > prev {
                            info!("Trade history grew: {} -> {}", prev, total);
                            task_flags.current.store(total, Ordering::SeqCst);
                            task_flags.changed.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => debug!("History poll failed: {}", e),
                }
            }
            task_flags.running.store(false, Ordering::SeqCst);
        });
        Self { flags, handle }
    }

    pub fn new_completions(&self) -> bool {
        self.flags.changed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flags.changed.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        self.flags.wake.notify_waiters();
        let _ = self.handle.await;
    }
}
