//! Error taxonomy shared by the API client, the live channel, and the engines.
//!
//! ERROR HANDLING
//! ==============
//! Auth failures are kept distinct from every other variant so callers can
//! force a re-login instead of retrying. Network and 429/5xx failures are
//! retryable by re-invoking the triggering action; nothing in this crate
//! retries a request on its own except the single token refresh on 401.

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by chat operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Connectivity failure, timeout, or broken transport.
    #[error("network failure: {0}")]
    Network(String),

    /// Credential missing, expired, or rejected after a refresh attempt.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Caller input rejected before any request was issued.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The resource does not exist or a page came back empty.
    #[error("not found or empty")]
    NotFoundOrEmpty,

    /// The server returned a non-success status not covered above.
    #[error("API response error: status {status}")]
    Api { status: u16, body: String },

    /// A response or event payload could not be deserialized.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Last-seen persistence failed.
    #[error("storage failed: {0}")]
    Storage(String),

    /// A configuration value is missing or invalid.
    #[error("config error: {0}")]
    Config(String),

    /// The real-time channel refused or dropped a subscription.
    #[error("channel error: {0}")]
    Channel(String),
}

impl ChatError {
    /// Stable machine-readable code for logs and UI mapping.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Network(_) => "E_NETWORK",
            Self::Auth(_) => "E_AUTH",
            Self::Validation(_) => "E_VALIDATION",
            Self::NotFoundOrEmpty => "E_NOT_FOUND",
            Self::Api { .. } => "E_API_RESPONSE",
            Self::Decode(_) => "E_DECODE",
            Self::Storage(_) => "E_STORAGE",
            Self::Config(_) => "E_CONFIG",
            Self::Channel(_) => "E_CHANNEL",
        }
    }

    /// Whether re-invoking the same action may succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Api { status: 429 | 500..=599, .. })
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        if let Some(status) = e.status() {
            return status_error(status.as_u16(), String::new());
        }
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Map a non-success HTTP status onto the taxonomy.
#[must_use]
pub fn status_error(status: u16, body: String) -> ChatError {
    match status {
        401 | 403 => ChatError::Auth(format!("status {status}")),
        404 => ChatError::NotFoundOrEmpty,
        _ => ChatError::Api { status, body },
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
