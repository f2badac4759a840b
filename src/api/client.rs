//! reqwest-backed REST client.
//!
//! ERROR HANDLING
//! ==============
//! A 401 triggers exactly one token refresh and one retry of the same
//! request. A second 401 is surfaced as `ChatError::Auth` so the caller can
//! force re-login instead of looping.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::token::TokenProvider;
use super::{ChallengeApi, MessageApi};
use crate::config::HttpTimeouts;
use crate::error::{ChatError, status_error};
use crate::types::{Challenge, ChatMessage, NewMessage};

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>, timeouts: HttpTimeouts) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), tokens })
    }

    /// Send a request built by `build`, refreshing the token once on 401.
    ///
    /// `build` is invoked again for the retry because multipart bodies are
    /// consumed by the first send.
    async fn send_authed<F>(&self, build: F) -> Result<reqwest::Response, ChatError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.tokens.access_token().await;
        let response = with_bearer(build(&self.http), token.as_deref())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        debug!("request unauthorized; refreshing token");
        let fresh = self.tokens.refresh(token.as_deref()).await?;
        let retry = with_bearer(build(&self.http), Some(&fresh))
            .send()
            .await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!("request unauthorized after token refresh");
            return Err(ChatError::Auth("credential rejected after refresh".into()));
        }
        check_status(retry).await
    }
}

fn with_bearer(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(t) => req.bearer_auth(t),
        None => req,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body))
}

// =============================================================================
// WIRE HELPERS
// =============================================================================

pub(crate) fn messages_url(base_url: &str, challenge_id: &str) -> String {
    format!("{base_url}/challenge/{challenge_id}/message")
}

pub(crate) fn ongoing_url(base_url: &str) -> String {
    format!("{base_url}/challenge/ongoing")
}

/// The backend has shipped both a bare array and a `{ "messages": [...] }` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum MessagesBody {
    List(Vec<ChatMessage>),
    Wrapped { messages: Vec<ChatMessage> },
}

pub(crate) fn parse_messages_body(text: &str) -> Result<Vec<ChatMessage>, ChatError> {
    let body: MessagesBody = serde_json::from_str(text)?;
    Ok(match body {
        MessagesBody::List(list) | MessagesBody::Wrapped { messages: list } => list,
    })
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    content: &'a str,
}

fn build_form(message: &NewMessage) -> Result<Form, ChatError> {
    let mut form = Form::new();
    if let Some(content) = message.content.as_deref() {
        form = form.text("content", content.to_string());
    }
    if let Some(image) = &message.image {
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.mime_type)
            .map_err(|e| ChatError::Validation(format!("invalid image mime type: {e}")))?;
        form = form.part("image", part);
    }
    Ok(form)
}

// =============================================================================
// TRAIT IMPLS
// =============================================================================

#[async_trait::async_trait]
impl MessageApi for ApiClient {
    async fn fetch_messages(&self, challenge_id: &str, limit: u32, page: u32) -> Result<Vec<ChatMessage>, ChatError> {
        let url = messages_url(&self.base_url, challenge_id);
        let response = self
            .send_authed(|http| http.get(&url).query(&[("limit", limit), ("page", page)]))
            .await?;
        let text = response.text().await?;
        parse_messages_body(&text)
    }

    async fn create_message(&self, challenge_id: &str, message: NewMessage) -> Result<ChatMessage, ChatError> {
        let url = messages_url(&self.base_url, challenge_id);
        let response = if message.image.is_some() {
            // Validate the mime type once up front; the closure below cannot propagate errors.
            build_form(&message)?;
            self.send_authed(|http| match build_form(&message) {
                Ok(form) => http.post(&url).multipart(form),
                Err(_) => http.post(&url),
            })
            .await?
        } else {
            let content = message.content.as_deref().unwrap_or_default();
            self.send_authed(|http| http.post(&url).json(&CreateMessageRequest { content }))
                .await?
        };
        Ok(response.json::<ChatMessage>().await?)
    }
}

#[async_trait::async_trait]
impl ChallengeApi for ApiClient {
    async fn fetch_ongoing(&self) -> Result<Vec<Challenge>, ChatError> {
        let url = ongoing_url(&self.base_url);
        let response = self.send_authed(|http| http.get(&url)).await?;
        Ok(response.json::<Vec<Challenge>>().await?)
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
