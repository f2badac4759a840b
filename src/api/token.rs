//! Bearer token providers for the REST client.
//!
//! TRADE-OFFS
//! ==========
//! `RefreshingToken` serializes refreshes behind an async mutex. Two requests
//! that hit 401 at the same time both call `refresh`, but the second one
//! finds the token already rotated and reuses it instead of burning the new
//! refresh token.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::HttpTimeouts;
use crate::error::{ChatError, status_error};

#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, if any.
    async fn access_token(&self) -> Option<String>;

    /// Obtain a fresh access token after the server rejected `stale`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Auth`] when the credential cannot be renewed.
    async fn refresh(&self, stale: Option<&str>) -> Result<String, ChatError>;
}

// =============================================================================
// STATIC TOKEN
// =============================================================================

/// Fixed token that can never be renewed.
pub struct StaticToken(Option<String>);

impl StaticToken {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }

    async fn refresh(&self, _stale: Option<&str>) -> Result<String, ChatError> {
        Err(ChatError::Auth("access token rejected and no refresh token configured".into()))
    }
}

// =============================================================================
// REFRESHING TOKEN
// =============================================================================

#[derive(Debug, Clone)]
struct TokenPair {
    access: Option<String>,
    refresh: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Access/refresh token pair renewed through `POST /auth/refresh`.
pub struct RefreshingToken {
    http: reqwest::Client,
    refresh_url: String,
    pair: Mutex<TokenPair>,
}

impl RefreshingToken {
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        access: Option<String>,
        refresh: String,
        timeouts: HttpTimeouts,
    ) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            http,
            refresh_url: format!("{}/auth/refresh", base_url.trim_end_matches('/')),
            pair: Mutex::new(TokenPair { access, refresh }),
        })
    }
}

#[async_trait::async_trait]
impl TokenProvider for RefreshingToken {
    async fn access_token(&self) -> Option<String> {
        self.pair.lock().await.access.clone()
    }

    async fn refresh(&self, stale: Option<&str>) -> Result<String, ChatError> {
        let mut pair = self.pair.lock().await;

        // EDGE: another request already rotated the token while we waited.
        if let Some(current) = pair.access.as_deref() {
            if stale != Some(current) {
                return Ok(current.to_string());
            }
        }

        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token: &pair.refresh })
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status, "token refresh rejected");
            return Err(match status_error(status, body) {
                ChatError::NotFoundOrEmpty => ChatError::Auth(format!("refresh endpoint returned {status}")),
                other => other,
            });
        }

        let body: RefreshResponse = response.json().await?;
        pair.access = Some(body.access_token.clone());
        if let Some(rotated) = body.refresh_token {
            pair.refresh = rotated;
        }
        info!("access token refreshed");
        Ok(body.access_token)
    }
}
