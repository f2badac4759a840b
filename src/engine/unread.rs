//! Unread-count aggregator.
//!
//! Holds its own subscription per ongoing challenge (same open/close rules
//! as the update coordinator) and counts activity newer than the viewer's
//! last-seen timestamp for that challenge. Counts are published on a
//! `watch` channel and recomputed whenever an event lands, the subscribed
//! set changes, or a last-seen timestamp moves forward.
//!
//! Each channel keeps the timestamps of the events it counted, so moving
//! last-seen past them drops them without waiting for new traffic. Events
//! whose sender is the viewer are applied but never counted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::{ChannelState, SubscriptionRegistry, spawn_pump};
use crate::realtime::{ChannelEvent, RealtimeChannel};
use crate::store::LastSeenStore;
use crate::store::challenges::challenge_ids;
use crate::types::{Challenge, UserProfile};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub per_challenge: BTreeMap<String, usize>,
    pub total: usize,
}

impl UnreadCounts {
    #[must_use]
    pub fn get(&self, challenge_id: &str) -> usize {
        self.per_challenge.get(challenge_id).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct UnreadChannel {
    last_applied: Option<i64>,
    /// Timestamps of counted events, all newer than last-seen when counted.
    unseen: Vec<i64>,
}

impl ChannelState for UnreadChannel {}

struct AggregatorState {
    viewer: Option<String>,
    registry: SubscriptionRegistry<UnreadChannel>,
}

pub struct UnreadAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    channel: Arc<dyn RealtimeChannel>,
    last_seen: LastSeenStore,
    state: Mutex<AggregatorState>,
    counts: watch::Sender<UnreadCounts>,
    follower: Mutex<Option<JoinHandle<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl UnreadAggregator {
    /// Build the aggregator and start following last-seen changes.
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(channel: Arc<dyn RealtimeChannel>, last_seen: LastSeenStore) -> Self {
        let (counts, _) = watch::channel(UnreadCounts::default());
        let changes = last_seen.subscribe();
        let inner = Arc::new(AggregatorInner {
            channel,
            last_seen,
            state: Mutex::new(AggregatorState { viewer: None, registry: SubscriptionRegistry::new() }),
            counts,
            follower: Mutex::new(None),
            driver: Mutex::new(None),
        });
        let follower = tokio::spawn(follow_last_seen(Arc::downgrade(&inner), changes));
        *lock(&inner.follower) = Some(follower);
        Self { inner }
    }

    /// Subscribe to `challenge_ids` on behalf of `user`. With no user every
    /// subscription is released and all counts are cleared.
    pub fn sync(&self, user: Option<&UserProfile>, challenge_ids: &[String]) {
        self.inner.sync(user, challenge_ids);
    }

    /// Follow identity and the ongoing set: sync now and on every change of
    /// either. Replaces any previous driver.
    pub fn follow(&self, mut identity: watch::Receiver<Option<UserProfile>>, mut ongoing: watch::Receiver<Vec<Challenge>>) {
        let weak = Arc::downgrade(&self.inner);
        let driver = tokio::spawn(async move {
            loop {
                let user = identity.borrow_and_update().clone();
                let ids = challenge_ids(&ongoing.borrow_and_update());
                match weak.upgrade() {
                    Some(inner) => inner.sync(user.as_ref(), &ids),
                    None => return,
                }
                tokio::select! {
                    changed = identity.changed() => if changed.is_err() { return },
                    changed = ongoing.changed() => if changed.is_err() { return },
                }
            }
        });
        if let Some(prior) = lock(&self.inner.driver).replace(driver) {
            prior.abort();
        }
    }

    #[must_use]
    pub fn counts(&self) -> watch::Receiver<UnreadCounts> {
        self.inner.counts.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> UnreadCounts {
        self.inner.counts.borrow().clone()
    }

    /// Release every subscription and the driver, and clear all counts.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for UnreadAggregator {
    fn drop(&mut self) {
        self.inner.close();
        if let Some(follower) = lock(&self.inner.follower).take() {
            follower.abort();
        }
    }
}

async fn follow_last_seen(weak: Weak<AggregatorInner>, mut changes: broadcast::Receiver<(String, i64)>) {
    loop {
        let change = changes.recv().await;
        let Some(inner) = weak.upgrade() else { return };
        match change {
            Ok((challenge_id, seen)) => inner.on_last_seen(&challenge_id, seen),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "last-seen feed lagged; reconciling all channels");
                inner.reconcile_all();
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl AggregatorInner {
    fn sync(self: &Arc<Self>, user: Option<&UserProfile>, challenge_ids: &[String]) {
        let mut state = lock(&self.state);
        let viewer = user.map(|u| u.id.clone());

        if state.viewer != viewer {
            let released = state.registry.close();
            if released > 0 {
                info!(released, "unread channels reset for new viewer");
            }
            state.viewer.clone_from(&viewer);
        }
        if viewer.is_none() {
            self.publish(&state);
            return;
        }

        let plan = state.registry.diff(challenge_ids);
        for id in &plan.removed {
            state.registry.remove(id);
            debug!(challenge_id = %id, "unread channel closed");
        }
        for id in plan.added {
            self.open(&mut state.registry, id);
        }
        self.publish(&state);
    }

    fn open(self: &Arc<Self>, registry: &mut SubscriptionRegistry<UnreadChannel>, challenge_id: String) {
        let subscription = match self.channel.subscribe(&challenge_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(%challenge_id, error = %e, "unread channel subscribe failed");
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
        debug!(%challenge_id, epoch, "unread channel opened");
        registry.insert(challenge_id, epoch, subscription.handle, pump, UnreadChannel::default());
    }

    fn on_event(&self, epoch: u64, event: &ChannelEvent) {
        let timestamp = event.effective_timestamp();
        let challenge_id = event.challenge_id.as_str();

        let mut state = lock(&self.state);
        let own = state.viewer.as_deref().is_some_and(|viewer| event.sender_id() == Some(viewer));
        let Some(channel) = state.registry.state_mut(challenge_id, epoch) else {
            return;
        };
        if channel.last_applied.is_some_and(|last| timestamp <= last) {
            return;
        }
        channel.last_applied = Some(timestamp);

        if own {
            return;
        }
        if self.last_seen.get(challenge_id).is_some_and(|seen| timestamp <= seen) {
            return;
        }
        channel.unseen.push(timestamp);
        self.publish(&state);
    }

    fn on_last_seen(&self, challenge_id: &str, seen: i64) {
        let mut state = lock(&self.state);
        let Some(channel) = state.registry.current_mut(challenge_id) else {
            return;
        };
        let before = channel.unseen.len();
        channel.unseen.retain(|&ts| ts > seen);
        if channel.unseen.len() != before {
            debug!(challenge_id, cleared = before - channel.unseen.len(), "unread cleared by last-seen");
            self.publish(&state);
        }
    }

    fn reconcile_all(&self) {
        let mut state = lock(&self.state);
        for (challenge_id, channel) in state.registry.states_mut() {
            if let Some(seen) = self.last_seen.get(challenge_id) {
                channel.unseen.retain(|&ts| ts > seen);
            }
        }
        self.publish(&state);
    }

    fn publish(&self, state: &AggregatorState) {
        let per_challenge: BTreeMap<String, usize> = state
            .registry
            .states()
            .map(|(id, channel)| (id.to_string(), channel.unseen.len()))
            .collect();
        let total = per_challenge.values().sum();
        let counts = UnreadCounts { per_challenge, total };

        self.counts.send_if_modified(|current| {
            if *current == counts {
                return false;
            }
            *current = counts;
            true
        });
    }

    fn close(&self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        let mut state = lock(&self.state);
        let released = state.registry.close();
        state.viewer = None;
        self.publish(&state);
        if released > 0 {
            info!(released, "unread aggregator closed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "unread_test.rs"]
mod tests;
