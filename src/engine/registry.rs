//! Per-component subscription registry.
//!
//! DESIGN
//! ======
//! Each coordinating component owns one `SubscriptionRegistry`: a map from
//! challenge id to the live subscription handle, the task pumping its
//! events, and the component's per-channel state. Entries are tagged with
//! an epoch; event and timer callbacks carry the epoch they were created
//! for and are ignored once that entry is gone or replaced, so nothing
//! fires into a torn-down channel.
//!
//! Releasing an entry unsubscribes, aborts the pump, and lets the
//! per-channel state drop its own resources (debounce timers), exactly once.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::realtime::{ChannelEvent, SubscriptionHandle};

/// Per-channel state owned by a registry entry.
pub trait ChannelState: Send {
    /// Release anything the state owns (timers). Called once on teardown.
    fn release(&mut self) {}
}

struct ChannelEntry<S> {
    epoch: u64,
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
    state: S,
}

impl<S: ChannelState> ChannelEntry<S> {
    fn release(mut self) {
        self.handle.unsubscribe();
        self.pump.abort();
        self.state.release();
    }
}

/// Channels to open and close to reach a wanted set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub struct SubscriptionRegistry<S: ChannelState> {
    entries: HashMap<String, ChannelEntry<S>>,
    next_epoch: u64,
}

impl<S: ChannelState> SubscriptionRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new(), next_epoch: 1 }
    }

    /// Epoch for the next entry; handed to callbacks before the entry exists.
    pub fn reserve_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    /// Diff the live set against `wanted`. Duplicates in `wanted` are ignored.
    #[must_use]
    pub fn diff(&self, wanted: &[String]) -> SyncPlan {
        let mut added: Vec<String> = Vec::new();
        for id in wanted {
            if !self.entries.contains_key(id) && !added.contains(id) {
                added.push(id.clone());
            }
        }
        let mut removed: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        removed.sort();
        SyncPlan { added, removed }
    }

    /// Insert an entry, releasing any prior entry for the same id first.
    /// Returns whether a prior entry was replaced.
    pub fn insert(&mut self, challenge_id: String, epoch: u64, handle: SubscriptionHandle, pump: JoinHandle<()>, state: S) -> bool {
        let prior = self.entries.remove(&challenge_id);
        let replaced = prior.is_some();
        if let Some(prior) = prior {
            prior.release();
        }
        self.entries.insert(challenge_id, ChannelEntry { epoch, handle, pump, state });
        replaced
    }

    /// Release and forget one channel. Returns whether it was live.
    pub fn remove(&mut self, challenge_id: &str) -> bool {
        match self.entries.remove(challenge_id) {
            Some(entry) => {
                entry.release();
                true
            }
            None => false,
        }
    }

    /// Release every channel. Returns how many were live.
    pub fn close(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.release();
        }
        count
    }

    /// State for `challenge_id` only if it still belongs to `epoch`.
    pub fn state_mut(&mut self, challenge_id: &str, epoch: u64) -> Option<&mut S> {
        self.entries
            .get_mut(challenge_id)
            .filter(|e| e.epoch == epoch)
            .map(|e| &mut e.state)
    }

    /// State for `challenge_id` regardless of epoch.
    pub fn current_mut(&mut self, challenge_id: &str) -> Option<&mut S> {
        self.entries.get_mut(challenge_id).map(|e| &mut e.state)
    }

    #[must_use]
    pub fn contains(&self, challenge_id: &str) -> bool {
        self.entries.contains_key(challenge_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, &S)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), &e.state))
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = (&str, &mut S)> {
        self.entries.iter_mut().map(|(id, e)| (id.as_str(), &mut e.state))
    }
}

impl<S: ChannelState> Default for SubscriptionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ChannelState> Drop for SubscriptionRegistry<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spawn the task that forwards one subscription's events to `on_event`.
pub fn spawn_pump<F>(mut events: mpsc::Receiver<ChannelEvent>, on_event: F) -> JoinHandle<()>
where
    F: Fn(ChannelEvent) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            on_event(event);
        }
    })
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
