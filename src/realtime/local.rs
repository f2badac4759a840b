//! In-process channel: fan-out of published payloads to local subscribers.
//!
//! Used by tests and by embedders that already receive activity records
//! through another transport and only need the subscription semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{ChannelEvent, EVENT_BUFFER, RealtimeChannel, Subscription, SubscriptionHandle};
use crate::error::ChatError;

type Listeners = HashMap<String, Vec<(u64, mpsc::Sender<ChannelEvent>)>>;

#[derive(Clone, Default)]
pub struct LocalChannel {
    listeners: Arc<Mutex<Listeners>>,
    next_id: Arc<AtomicU64>,
    opened: Arc<AtomicU64>,
}

impl LocalChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every live listener on `challenge_id`.
    /// Returns the number of listeners that accepted it.
    pub fn publish(&self, challenge_id: &str, payload: Value) -> usize {
        let event = ChannelEvent::new(challenge_id, payload);
        self.publish_event(event)
    }

    /// Deliver a pre-built event, keeping its observation time.
    pub fn publish_event(&self, event: ChannelEvent) -> usize {
        let listeners = self.lock();
        let Some(targets) = listeners.get(&event.challenge_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (_, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(challenge_id = %event.challenge_id, "channel listener full; dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Number of live listeners on `challenge_id`.
    #[must_use]
    pub fn subscriber_count(&self, challenge_id: &str) -> usize {
        self.lock().get(challenge_id).map_or(0, Vec::len)
    }

    /// Total subscriptions ever opened on this channel.
    #[must_use]
    pub fn subscriptions_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl RealtimeChannel for LocalChannel {
    fn subscribe(&self, challenge_id: &str) -> Result<Subscription, ChatError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().entry(challenge_id.to_string()).or_default().push((id, tx));
        self.opened.fetch_add(1, Ordering::SeqCst);

        let listeners = self.listeners.clone();
        let key = challenge_id.to_string();
        let handle = SubscriptionHandle::new(move || {
            let mut listeners = listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(list) = listeners.get_mut(&key) {
                list.retain(|(listener_id, _)| *listener_id != id);
                if list.is_empty() {
                    listeners.remove(&key);
                }
            }
        });

        Ok(Subscription { events: rx, handle })
    }
}

#[cfg(test)]
#[path = "local_test.rs"]
mod tests;
