//! Real-time update channel carrying per-challenge "last activity" records.
//!
//! ARCHITECTURE
//! ============
//! A `RealtimeChannel` hands out one `Subscription` per call: a bounded
//! receiver of `ChannelEvent`s plus a `SubscriptionHandle` that releases the
//! server-side listener. Components never share subscriptions; the update
//! coordinator and the unread aggregator each subscribe to the same
//! challenge independently.

pub mod firebase;
pub mod local;

pub use firebase::FirebaseChannel;
pub use local::LocalChannel;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::types::now_ms;

/// Per-subscription event buffer. Producers drop events when it is full.
pub const EVENT_BUFFER: usize = 256;

/// Payload fields that carry an explicit event time, in preference order.
const TIMESTAMP_FIELDS: [&str; 3] = ["timestamp", "lastMessageAt", "updatedAt"];

/// Payload fields that carry the acting user.
const SENDER_FIELDS: [&str; 2] = ["senderId", "lastSenderId"];

// =============================================================================
// EVENT
// =============================================================================

/// One new or changed record under a challenge's channel key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub challenge_id: String,
    pub payload: Value,
    /// Epoch milliseconds at which this client observed the event.
    pub observed_at: i64,
}

impl ChannelEvent {
    #[must_use]
    pub fn new(challenge_id: impl Into<String>, payload: Value) -> Self {
        Self { challenge_id: challenge_id.into(), payload, observed_at: now_ms() }
    }

    /// Event time carried in the payload, if any.
    #[must_use]
    pub fn explicit_timestamp(&self) -> Option<i64> {
        TIMESTAMP_FIELDS.iter().find_map(|key| {
            let value = self.payload.get(key)?;
            #[allow(clippy::cast_possible_truncation)]
            value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
        })
    }

    /// Explicit payload time, falling back to the observation time.
    ///
    /// Without an explicit time, any delivery of a record counts as newer
    /// than the last. Channels must not replay an unchanged record, or the
    /// replay reads as fresh activity.
    #[must_use]
    pub fn effective_timestamp(&self) -> i64 {
        self.explicit_timestamp().unwrap_or(self.observed_at)
    }

    #[must_use]
    pub fn sender_id(&self) -> Option<&str> {
        SENDER_FIELDS
            .iter()
            .find_map(|key| self.payload.get(key).and_then(Value::as_str))
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Releases a channel listener. Safe to call any number of times; also
/// released on drop.
pub struct SubscriptionHandle {
    released: AtomicBool,
    release: Mutex<Option<ReleaseFn>>,
}

impl SubscriptionHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { released: AtomicBool::new(false), release: Mutex::new(Some(Box::new(release))) }
    }

    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let release = self
            .release
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            release();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("active", &self.is_active()).finish()
    }
}

/// A live listener on one challenge key.
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::Receiver<ChannelEvent>,
    pub handle: SubscriptionHandle,
}

/// Subscribe-by-key event source.
pub trait RealtimeChannel: Send + Sync {
    /// Register a listener on `challenge_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the listener cannot be registered.
    fn subscribe(&self, challenge_id: &str) -> Result<Subscription, ChatError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
