//! Live-update coordinator: per-challenge subscriptions that coalesce bursts
//! of activity into a single forced refresh of the challenge list.
//!
//! DESIGN
//! ======
//! One subscription per ongoing challenge, held in a `SubscriptionRegistry`
//! whose per-channel state is a `DebounceController`. For each event:
//!
//! 1. timestamp = explicit payload time, else observation time
//! 2. drop it unless it is newer than the channel's last applied event
//! 3. drop it while any refresh is in flight (one flag for all channels)
//! 4. otherwise restart the channel's debounce timer
//!
//! When a timer elapses and no refresh is in flight, the coordinator claims
//! the flag, records the event as applied, and runs
//! `fetch_challenges(force = true)` in its own task. The flag is cleared
//! when that task finishes, success or failure. Failed refreshes are logged
//! and not retried.
//!
//! LIFECYCLE
//! =========
//! `sync` diffs the wanted set against the registry. Removed channels lose
//! their subscription, pump and pending timer at once. Timers and pumps
//! hold only a `Weak` to the coordinator and check the entry epoch before
//! touching state, so nothing fires after `close` or removal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::{ChannelState, SubscriptionRegistry, spawn_pump};
use crate::realtime::{ChannelEvent, RealtimeChannel};
use crate::store::ChallengeSource;
use crate::store::challenges::challenge_ids;
use crate::types::Challenge;

/// Per-channel debounce state.
#[derive(Default)]
pub struct DebounceController {
    last_applied: Option<i64>,
    pending: Option<PendingFire>,
    next_token: u64,
}

struct PendingFire {
    token: u64,
    timestamp: i64,
    timer: JoinHandle<()>,
}

impl DebounceController {
    #[must_use]
    pub fn last_applied(&self) -> Option<i64> {
        self.last_applied
    }

    #[must_use]
    pub fn has_pending_timer(&self) -> bool {
        self.pending.is_some()
    }

    fn is_stale(&self, timestamp: i64) -> bool {
        self.last_applied.is_some_and(|last| timestamp <= last)
    }

    /// Replace any pending timer with one from `spawn`, which receives the
    /// token the timer must present when it fires.
    fn restart(&mut self, timestamp: i64, spawn: impl FnOnce(u64) -> JoinHandle<()>) {
        if let Some(prior) = self.pending.take() {
            prior.timer.abort();
        }
        self.next_token += 1;
        let token = self.next_token;
        self.pending = Some(PendingFire { token, timestamp, timer: spawn(token) });
    }

    /// Take the pending fire if `token` is still current.
    fn take_if_current(&mut self, token: u64) -> Option<i64> {
        if self.pending.as_ref().is_some_and(|p| p.token == token) {
            return self.pending.take().map(|p| p.timestamp);
        }
        None
    }
}

impl ChannelState for DebounceController {
    fn release(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
    }
}

pub struct UpdateCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    channel: Arc<dyn RealtimeChannel>,
    source: Arc<dyn ChallengeSource>,
    debounce: Duration,
    registry: Mutex<SubscriptionRegistry<DebounceController>>,
    refreshing: Arc<AtomicBool>,
    refreshes: Arc<AtomicU64>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateCoordinator {
    #[must_use]
    pub fn new(channel: Arc<dyn RealtimeChannel>, source: Arc<dyn ChallengeSource>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                channel,
                source,
                debounce,
                registry: Mutex::new(SubscriptionRegistry::new()),
                refreshing: Arc::new(AtomicBool::new(false)),
                refreshes: Arc::new(AtomicU64::new(0)),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to every id in `challenge_ids` and drop every other channel.
    pub fn sync(&self, challenge_ids: &[String]) {
        self.inner.sync(challenge_ids);
    }

    /// Follow the ongoing set: sync now and again on every change. Replaces
    /// any previous watcher.
    pub fn watch_ongoing(&self, mut ongoing: watch::Receiver<Vec<Challenge>>) {
        let weak = Arc::downgrade(&self.inner);
        let driver = tokio::spawn(async move {
            loop {
                let ids = challenge_ids(&ongoing.borrow_and_update());
                match weak.upgrade() {
                    Some(inner) => inner.sync(&ids),
                    None => return,
                }
                if ongoing.changed().await.is_err() {
                    return;
                }
            }
        });
        if let Some(prior) = self.inner.lock_driver().replace(driver) {
            prior.abort();
        }
    }

    /// Release every subscription, timer and watcher.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Refreshes started since construction.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        let registry = self.inner.lock();
        let mut ids: Vec<String> = registry.states().map(|(id, _)| id.to_string()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().states().filter(|(_, s)| s.has_pending_timer()).count()
    }

    #[must_use]
    pub fn last_applied(&self, challenge_id: &str) -> Option<i64> {
        self.inner.lock().current_mut(challenge_id).and_then(|s| s.last_applied())
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl CoordinatorInner {
    fn sync(self: &Arc<Self>, challenge_ids: &[String]) {
        let mut registry = self.lock();
        let plan = registry.diff(challenge_ids);

        for id in &plan.removed {
            registry.remove(id);
            info!(challenge_id = %id, "update channel closed");
        }
        for id in plan.added {
            self.open(&mut registry, id);
        }
    }

    fn open(self: &Arc<Self>, registry: &mut SubscriptionRegistry<DebounceController>, challenge_id: String) {
        let subscription = match self.channel.subscribe(&challenge_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(%challenge_id, error = %e, "update channel subscribe failed");
                return;
            }
        };

        let epoch = registry.reserve_epoch();
        let weak = Arc::downgrade(self);
        let pump = spawn_pump(subscription.events, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(epoch, &event);
            }
        });
        debug!(%challenge_id, epoch, "update channel opened");
        registry.insert(challenge_id, epoch, subscription.handle, pump, DebounceController::default());
    }

    fn on_event(self: &Arc<Self>, epoch: u64, event: &ChannelEvent) {
        let timestamp = event.effective_timestamp();
        let challenge_id = event.challenge_id.as_str();

        let mut registry = self.lock();
        let Some(controller) = registry.state_mut(challenge_id, epoch) else {
            return;
        };
        if controller.is_stale(timestamp) {
            debug!(challenge_id, timestamp, "stale update ignored");
            return;
        }
        if self.refreshing.load(Ordering::SeqCst) {
            debug!(challenge_id, timestamp, "update ignored; refresh in flight");
            return;
        }

        let weak = Arc::downgrade(self);
        let debounce = self.debounce;
        let id = challenge_id.to_string();
        controller.restart(timestamp, move |token| {
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire(&id, epoch, token);
                }
            })
        });
    }

    fn fire(&self, challenge_id: &str, epoch: u64, token: u64) {
        let mut registry = self.lock();
        let Some(controller) = registry.state_mut(challenge_id, epoch) else {
            return;
        };
        let Some(timestamp) = controller.take_if_current(token) else {
            return;
        };
        if self.refreshing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            debug!(challenge_id, "debounce elapsed during refresh; dropped");
            return;
        }
        controller.last_applied = Some(timestamp);
        drop(registry);

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        info!(challenge_id, timestamp, "refreshing challenges");

        let source = self.source.clone();
        let refreshing = self.refreshing.clone();
        tokio::spawn(async move {
            match source.fetch_challenges(true).await {
                Ok(challenges) => debug!(count = challenges.len(), "challenge refresh complete"),
                Err(e) => warn!(error = %e, "challenge refresh failed"),
            }
            refreshing.store(false, Ordering::SeqCst);
        });
    }

    fn close(&self) {
        if let Some(driver) = self.lock_driver().take() {
            driver.abort();
        }
        let released = self.lock().close();
        if released > 0 {
            info!(released, "update coordinator closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionRegistry<DebounceController>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "updates_test.rs"]
mod tests;
