//! Wire and domain types shared across the crate.
//!
//! DESIGN
//! ======
//! Payloads mirror the REST backend's camelCase JSON. Timestamps are epoch
//! milliseconds everywhere so that message ordering, channel event ordering,
//! and last-seen comparisons use one clock unit.

use serde::{Deserialize, Serialize};

/// Prefix of client-generated message ids awaiting server confirmation.
pub const TEMP_ID_PREFIX: &str = "temp-";

// =============================================================================
// USERS
// =============================================================================

/// Snapshot of a sender's profile as embedded in a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// The locally authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    #[must_use]
    pub fn sender_snapshot(&self) -> SenderProfile {
        SenderProfile {
            id: self.id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// A single chat message in a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub sender_id: String,
    pub challenge_id: String,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    #[serde(default)]
    pub sender: Option<SenderProfile>,
}

impl ChatMessage {
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Image bytes attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Outgoing message body for `POST /challenge/{id}/message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: Option<String>,
    pub image: Option<ImageAttachment>,
}

// =============================================================================
// CHALLENGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Upcoming,
    Ongoing,
    Ended,
}

/// Challenge summary; only the fields the chat subsystem reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub last_message_at: Option<i64>,
    #[serde(default)]
    pub participant_count: Option<u32>,
}

// =============================================================================
// TIME
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
