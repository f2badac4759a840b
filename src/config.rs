//! Chat configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ChatError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_UPDATE_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_CHALLENGE_CACHE_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UPDATES_PATH: &str = "challengeUpdates";
pub const DEFAULT_LAST_SEEN_PATH: &str = "./last_seen.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

/// Firebase Realtime Database endpoint for per-challenge activity records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirebaseConfig {
    pub database_url: String,
    pub auth_token: Option<String>,
    pub updates_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub refresh_token: Option<String>,
    pub firebase: Option<FirebaseConfig>,
    pub page_size: u32,
    pub update_debounce_ms: u64,
    pub challenge_cache_secs: u64,
    pub last_seen_path: PathBuf,
    pub timeouts: HttpTimeouts,
}

impl ChatConfig {
    /// Build typed chat config from environment variables.
    ///
    /// Required:
    /// - `CHAT_API_BASE_URL`
    ///
    /// Optional:
    /// - `CHAT_API_TOKEN`, `CHAT_REFRESH_TOKEN`
    /// - `FIREBASE_DATABASE_URL` (live updates disabled when absent)
    /// - `FIREBASE_AUTH_TOKEN`, `FIREBASE_UPDATES_PATH` (default `challengeUpdates`)
    /// - `CHAT_PAGE_SIZE`: default 20
    /// - `CHAT_UPDATE_DEBOUNCE_MS`: default 500
    /// - `CHAT_CHALLENGE_CACHE_SECS`: default 30
    /// - `CHAT_LAST_SEEN_PATH`: default `./last_seen.json`
    /// - `CHAT_REQUEST_TIMEOUT_SECS`: default 30
    /// - `CHAT_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] if the base URL is missing or the page size is zero.
    pub fn from_env() -> Result<Self, ChatError> {
        let api_base_url = std::env::var("CHAT_API_BASE_URL")
            .map_err(|_| ChatError::Config("CHAT_API_BASE_URL not set".into()))?;
        let api_base_url = trim_url(&api_base_url);
        if api_base_url.is_empty() {
            return Err(ChatError::Config("CHAT_API_BASE_URL is empty".into()));
        }

        let firebase = env_non_empty("FIREBASE_DATABASE_URL").map(|url| FirebaseConfig {
            database_url: trim_url(&url),
            auth_token: env_non_empty("FIREBASE_AUTH_TOKEN"),
            updates_path: env_non_empty("FIREBASE_UPDATES_PATH")
                .map_or_else(|| DEFAULT_UPDATES_PATH.to_string(), |p| p.trim_matches('/').to_string()),
        });

        let page_size = env_parse("CHAT_PAGE_SIZE", DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(ChatError::Config("CHAT_PAGE_SIZE must be greater than zero".into()));
        }

        Ok(Self {
            api_base_url,
            api_token: env_non_empty("CHAT_API_TOKEN"),
            refresh_token: env_non_empty("CHAT_REFRESH_TOKEN"),
            firebase,
            page_size,
            update_debounce_ms: env_parse("CHAT_UPDATE_DEBOUNCE_MS", DEFAULT_UPDATE_DEBOUNCE_MS),
            challenge_cache_secs: env_parse("CHAT_CHALLENGE_CACHE_SECS", DEFAULT_CHALLENGE_CACHE_SECS),
            last_seen_path: env_non_empty("CHAT_LAST_SEEN_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_LAST_SEEN_PATH), PathBuf::from),
            timeouts: HttpTimeouts {
                request_secs: env_parse("CHAT_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: env_parse("CHAT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
        })
    }

    #[must_use]
    pub fn update_debounce(&self) -> Duration {
        Duration::from_millis(self.update_debounce_ms)
    }

    #[must_use]
    pub fn challenge_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_cache_secs)
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn trim_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
