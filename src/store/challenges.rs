//! Ongoing-challenge store with a short-lived cache.
//!
//! DESIGN
//! ======
//! Every successful fetch publishes the ongoing set on a `watch` channel.
//! The update coordinator and the unread aggregator both observe that
//! channel to open and close their per-challenge subscriptions, and the
//! coordinator's coalesced refresh writes back into it with `force = true`.
//!
//! TRADE-OFFS
//! ==========
//! The cache sits behind an async mutex held across the API call, so
//! concurrent non-forced callers wait for the in-progress fetch and then get
//! its result instead of issuing their own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::api::ChallengeApi;
use crate::error::ChatError;
use crate::types::{Challenge, ChallengeStatus};

/// Anything that can produce the current ongoing-challenge set.
#[async_trait::async_trait]
pub trait ChallengeSource: Send + Sync {
    /// `force = true` bypasses every cache and returns current server state.
    ///
    /// # Errors
    ///
    /// Returns a [`ChatError`] if the underlying fetch fails.
    async fn fetch_challenges(&self, force: bool) -> Result<Vec<Challenge>, ChatError>;
}

struct CacheEntry {
    fetched_at: Instant,
    challenges: Vec<Challenge>,
}

pub struct ChallengeStore {
    api: Arc<dyn ChallengeApi>,
    ttl: Duration,
    cache: Mutex<Option<CacheEntry>>,
    ongoing: watch::Sender<Vec<Challenge>>,
}

impl ChallengeStore {
    #[must_use]
    pub fn new(api: Arc<dyn ChallengeApi>, ttl: Duration) -> Self {
        let (ongoing, _) = watch::channel(Vec::new());
        Self { api, ttl, cache: Mutex::new(None), ongoing }
    }

    /// Live view of the ongoing set; updated after every successful fetch.
    #[must_use]
    pub fn ongoing(&self) -> watch::Receiver<Vec<Challenge>> {
        self.ongoing.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> Vec<Challenge> {
        self.ongoing.borrow().clone()
    }
}

#[async_trait::async_trait]
impl ChallengeSource for ChallengeStore {
    async fn fetch_challenges(&self, force: bool) -> Result<Vec<Challenge>, ChatError> {
        let mut cache = self.cache.lock().await;

        if !force {
            if let Some(entry) = cache.as_ref().filter(|e| e.fetched_at.elapsed() < self.ttl) {
                debug!(count = entry.challenges.len(), "challenge cache hit");
                return Ok(entry.challenges.clone());
            }
        }

        let challenges: Vec<Challenge> = self
            .api
            .fetch_ongoing()
            .await?
            .into_iter()
            .filter(|c| c.status == ChallengeStatus::Ongoing)
            .collect();

        *cache = Some(CacheEntry { fetched_at: Instant::now(), challenges: challenges.clone() });
        self.ongoing.send_if_modified(|current| {
            if *current == challenges {
                return false;
            }
            current.clone_from(&challenges);
            true
        });
        debug!(count = challenges.len(), force, "challenges fetched");
        Ok(challenges)
    }
}

/// Ids of `challenges`, in order, without duplicates.
#[must_use]
pub fn challenge_ids(challenges: &[Challenge]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(challenges.len());
    for c in challenges {
        if !ids.contains(&c.id) {
            ids.push(c.id.clone());
        }
    }
    ids
}

#[cfg(test)]
#[path = "challenges_test.rs"]
mod tests;
