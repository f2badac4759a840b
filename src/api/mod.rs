//! REST collaborators: message pagination and creation, challenge summaries.
//!
//! DESIGN
//! ======
//! Engines depend on the `MessageApi` / `ChallengeApi` traits, never on the
//! HTTP client directly, so tests swap in mocks and embedders can route the
//! calls through their own transport. `ApiClient` is the reqwest-backed
//! implementation of both.

pub mod client;
pub mod token;

pub use client::ApiClient;
pub use token::{RefreshingToken, StaticToken, TokenProvider};

use crate::error::ChatError;
use crate::types::{Challenge, ChatMessage, NewMessage};

/// Paginated chat message endpoint for one challenge.
#[async_trait::async_trait]
pub trait MessageApi: Send + Sync {
    /// Fetch one page of messages, newest first. Pages are 1-based.
    ///
    /// # Errors
    ///
    /// Returns a [`ChatError`] on transport, auth, or decode failure.
    async fn fetch_messages(&self, challenge_id: &str, limit: u32, page: u32) -> Result<Vec<ChatMessage>, ChatError>;

    /// Submit a new message and return the server-confirmed copy.
    ///
    /// # Errors
    ///
    /// Returns a [`ChatError`] on transport, auth, or decode failure.
    async fn create_message(&self, challenge_id: &str, message: NewMessage) -> Result<ChatMessage, ChatError>;
}

/// Source of the current ongoing-challenge set.
#[async_trait::async_trait]
pub trait ChallengeApi: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`ChatError`] on transport, auth, or decode failure.
    async fn fetch_ongoing(&self) -> Result<Vec<Challenge>, ChatError>;
}
