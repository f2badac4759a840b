//! Message pagination and optimistic send for the open challenge.
//!
//! DESIGN
//! ======
//! `MessageEngine` owns the message list of one open challenge at a time.
//! The list is newest first: provisional `temp-` messages sit at the head,
//! confirmed messages follow in descending creation order, and older pages
//! are appended at the tail.
//!
//! Every `open`/`close` bumps a generation counter. Fetches and sends record
//! the generation they were issued under and drop their effect on arrival if
//! the viewer has moved on, so a late page for the previous challenge never
//! lands in the current list.
//!
//! CONCURRENCY
//! ===========
//! At most one page fetch is in flight; the `loading` and `loading_more`
//! flags are checked and set under the state lock before the request goes
//! out. Sends are independent of fetches. Provisional inserts happen
//! immediately, but remote creates go through `send_queue` one at a time so
//! confirmations arrive in the order the user sent them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::api::MessageApi;
use crate::error::ChatError;
use crate::store::{Identity, LastSeenStore};
use crate::types::{ChatMessage, ImageAttachment, NewMessage, TEMP_ID_PREFIX, now_ms};

/// Observable state of the open challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationState {
    pub challenge_id: Option<String>,
    pub generation: u64,
    pub messages: Vec<ChatMessage>,
    /// Last page successfully loaded.
    pub page: u32,
    pub has_more: bool,
    pub loading: bool,
    pub loading_more: bool,
    /// Sends issued but not yet confirmed or rolled back.
    pub pending_sends: usize,
    pub error: Option<String>,
}

impl PaginationState {
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.pending_sends > 0
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.loading || self.loading_more
    }

    fn reset(&mut self, challenge_id: Option<String>) {
        let generation = self.generation + 1;
        *self = Self {
            has_more: challenge_id.is_some(),
            // Nothing loaded yet: the next fetch is page 1.
            page: 0,
            challenge_id,
            generation,
            ..Self::default()
        };
    }

    fn leading_temporary(&self) -> usize {
        self.messages.iter().take_while(|m| m.is_temporary()).count()
    }
}

/// What a fetch call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The page arrived and was applied.
    Applied { received: usize },
    /// Refused: another fetch is in flight.
    Busy,
    /// Refused: the last page already came back short.
    Exhausted,
    /// No challenge is open.
    NoChallenge,
    /// The open challenge changed while the request was in flight.
    Stale,
}

#[derive(Clone, Copy)]
enum FetchKind {
    Load,
    More,
}

pub struct MessageEngine {
    api: Arc<dyn MessageApi>,
    identity: Identity,
    last_seen: LastSeenStore,
    page_size: u32,
    state: Mutex<PaginationState>,
    send_queue: tokio::sync::Mutex<()>,
}

impl MessageEngine {
    #[must_use]
    pub fn new(api: Arc<dyn MessageApi>, identity: Identity, last_seen: LastSeenStore, page_size: u32) -> Self {
        Self {
            api,
            identity,
            last_seen,
            page_size: page_size.max(1),
            state: Mutex::new(PaginationState::default()),
            send_queue: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PaginationState {
        self.lock().clone()
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Switch to `challenge_id`, mark it seen, and load page 1.
    ///
    /// # Errors
    ///
    /// Returns the page-1 fetch error. The challenge stays open with an
    /// empty list and the error recorded.
    pub async fn open(&self, challenge_id: &str) -> Result<FetchOutcome, ChatError> {
        {
            let mut state = self.lock();
            state.reset(Some(challenge_id.to_string()));
            info!(challenge_id, generation = state.generation, "challenge opened");
        }

        if let Err(e) = self.last_seen.mark_seen_async(challenge_id).await {
            warn!(challenge_id, error = %e, "last-seen write failed");
        }

        self.fetch_page(1, true).await
    }

    /// Leave the open challenge. In-flight results for it are discarded.
    pub fn close(&self) {
        let mut state = self.lock();
        if let Some(challenge_id) = state.challenge_id.take() {
            debug!(%challenge_id, "challenge closed");
        }
        state.reset(None);
    }

    /// Fetch `page`, replacing the list when `replace` is set and appending
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns the API error. The list and page counter are left unchanged.
    pub async fn fetch_page(&self, page: u32, replace: bool) -> Result<FetchOutcome, ChatError> {
        self.fetch(FetchKind::Load, Some(page), replace).await
    }

    /// Append the next page if there is one and nothing else is loading.
    ///
    /// # Errors
    ///
    /// Returns the API error. The list and page counter are left unchanged.
    pub async fn fetch_more(&self) -> Result<FetchOutcome, ChatError> {
        self.fetch(FetchKind::More, None, false).await
    }

    async fn fetch(&self, kind: FetchKind, page: Option<u32>, replace: bool) -> Result<FetchOutcome, ChatError> {
        let (challenge_id, generation, page) = {
            let mut state = self.lock();
            let Some(challenge_id) = state.challenge_id.clone() else {
                return Ok(FetchOutcome::NoChallenge);
            };
            if state.is_fetching() {
                debug!(%challenge_id, "fetch refused; another is in flight");
                return Ok(FetchOutcome::Busy);
            }
            if matches!(kind, FetchKind::More) && !state.has_more {
                return Ok(FetchOutcome::Exhausted);
            }
            match kind {
                FetchKind::Load => state.loading = true,
                FetchKind::More => state.loading_more = true,
            }
            (challenge_id, state.generation, page.unwrap_or(state.page + 1))
        };

        let result = self.api.fetch_messages(&challenge_id, self.page_size, page).await;

        let mut state = self.lock();
        if state.generation != generation {
            debug!(%challenge_id, page, "discarding page for a closed challenge");
            return Ok(FetchOutcome::Stale);
        }
        state.loading = false;
        state.loading_more = false;

        let batch = match result {
            Ok(batch) => batch,
            Err(ChatError::NotFoundOrEmpty) => Vec::new(),
            Err(e) => {
                warn!(%challenge_id, page, error = %e, "message fetch failed");
                state.error = Some(e.to_string());
                return Err(e);
            }
        };

        let received = batch.len();
        state.has_more = received == self.page_size as usize;
        state.page = page;
        state.error = None;
        if replace {
            let mut messages: Vec<ChatMessage> = state.messages.drain(..).filter(ChatMessage::is_temporary).collect();
            messages.extend(batch);
            state.messages = messages;
        } else {
            let known: HashSet<String> = state.messages.iter().map(|m| m.id.clone()).collect();
            state.messages.extend(batch.into_iter().filter(|m| !known.contains(&m.id)));
        }

        debug!(%challenge_id, page, received, has_more = state.has_more, "page applied");
        Ok(FetchOutcome::Applied { received })
    }

    /// Send a message to the open challenge.
    ///
    /// A provisional copy is inserted at the head of the list immediately and
    /// replaced by the server's message on success or removed on failure.
    /// Returns `Ok(None)` when no challenge is open.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] if both content and image are empty; the
    ///   list is untouched.
    /// - [`ChatError::Auth`] if nobody is signed in.
    /// - The API error after the provisional message has been rolled back.
    pub async fn send(&self, content: &str, image: Option<ImageAttachment>) -> Result<Option<ChatMessage>, ChatError> {
        let content = content.trim();
        if content.is_empty() && image.is_none() {
            return Err(ChatError::Validation("message has no content or image".into()));
        }
        let content = (!content.is_empty()).then(|| content.to_string());

        let (challenge_id, generation, temp_id) = {
            let mut state = self.lock();
            let Some(challenge_id) = state.challenge_id.clone() else {
                return Ok(None);
            };
            let user = self
                .identity
                .current()
                .ok_or_else(|| ChatError::Auth("no signed-in user".into()))?;

            let temp_id = format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4());
            let provisional = ChatMessage {
                id: temp_id.clone(),
                content: content.clone(),
                image_url: None,
                sender_id: user.id.clone(),
                challenge_id: challenge_id.clone(),
                created_at: now_ms(),
                sender: Some(user.sender_snapshot()),
            };
            state.messages.insert(0, provisional);
            state.pending_sends += 1;
            (challenge_id, state.generation, temp_id)
        };

        let result = {
            let _turn = self.send_queue.lock().await;
            self.api.create_message(&challenge_id, NewMessage { content, image }).await
        };

        let mut state = self.lock();
        if state.generation != generation {
            debug!(%challenge_id, "send settled after challenge closed");
            return result.map(Some);
        }
        state.pending_sends = state.pending_sends.saturating_sub(1);
        state.messages.retain(|m| m.id != temp_id);

        match result {
            Ok(message) => {
                state.messages.retain(|m| m.id != message.id);
                let at = state.leading_temporary();
                state.messages.insert(at, message.clone());
                info!(%challenge_id, message_id = %message.id, "message sent");
                Ok(Some(message))
            }
            Err(e) => {
                warn!(%challenge_id, error = %e, "message send failed; rolled back");
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaginationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "messages_test.rs"]
mod tests;
