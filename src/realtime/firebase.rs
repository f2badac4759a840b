//! Firebase Realtime Database listener over the REST streaming protocol.
//!
//! DESIGN
//! ======
//! `GET {db}/{path}/{challenge}.json` with `Accept: text/event-stream`
//! yields `put` / `patch` events relative to the challenge node. The stream
//! task keeps a local mirror of the node, applies each event to it, and
//! emits the whole record as one `ChannelEvent`, so consumers always see the
//! node's current value rather than a partial diff.
//!
//! Every connection opens with a `put` of the full node. The last record
//! handed to the consumer survives reconnects, and a record equal to it is
//! not emitted again, so a reconnect alone never looks like new activity.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures and server-side closes reconnect with linear backoff
//! plus jitter until the subscription is released. `auth_revoked` and
//! `cancel` end the stream for good; they need new credentials, not retries.

use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ChannelEvent, EVENT_BUFFER, RealtimeChannel, Subscription, SubscriptionHandle};
use crate::config::{FirebaseConfig, HttpTimeouts};
use crate::error::ChatError;

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;
const RECONNECT_JITTER_MS: u64 = 250;
/// Largest incomplete frame the parser will buffer.
pub(crate) const MAX_FRAME_BYTES: usize = 1 << 20;

pub struct FirebaseChannel {
    http: reqwest::Client,
    config: FirebaseConfig,
}

impl FirebaseChannel {
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] if the HTTP client cannot be built.
    pub fn new(config: FirebaseConfig, timeouts: HttpTimeouts) -> Result<Self, ChatError> {
        // No overall request timeout: the stream stays open indefinitely.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self { http, config })
    }

    #[must_use]
    pub fn node_url(&self, challenge_id: &str) -> String {
        node_url(&self.config, challenge_id)
    }
}

pub(crate) fn node_url(config: &FirebaseConfig, challenge_id: &str) -> String {
    let mut url = format!("{}/{}/{}.json", config.database_url, config.updates_path, challenge_id);
    if let Some(token) = &config.auth_token {
        url.push_str("?auth=");
        url.push_str(token);
    }
    url
}

impl RealtimeChannel for FirebaseChannel {
    fn subscribe(&self, challenge_id: &str) -> Result<Subscription, ChatError> {
        if challenge_id.is_empty() || challenge_id.contains(['/', '.', '#', '$', '[', ']']) {
            return Err(ChatError::Channel(format!("invalid channel key: {challenge_id:?}")));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_listener(
            self.http.clone(),
            self.node_url(challenge_id),
            challenge_id.to_string(),
            tx,
        ));
        let abort = task.abort_handle();
        let handle = SubscriptionHandle::new(move || abort.abort());
        Ok(Subscription { events: rx, handle })
    }
}

// =============================================================================
// LISTENER TASK
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// Server closed or transport failed; reconnect.
    Dropped,
    /// Credentials revoked or listener cancelled; stop.
    Terminated,
    /// Nobody is reading events anymore; stop.
    ReceiverGone,
}

async fn run_listener(http: reqwest::Client, url: String, challenge_id: String, tx: mpsc::Sender<ChannelEvent>) {
    let mut attempt: u64 = 0;
    let mut last_sent = None;
    loop {
        let (end, delivered) = stream_once(&http, &url, &challenge_id, &tx, &mut last_sent).await;
        match end {
            StreamEnd::Terminated => {
                warn!(%challenge_id, "live channel terminated by server");
                return;
            }
            StreamEnd::ReceiverGone => return,
            StreamEnd::Dropped => {}
        }
        if tx.is_closed() {
            return;
        }

        attempt = if delivered { 1 } else { attempt + 1 };
        let delay = reconnect_delay(attempt);
        info!(%challenge_id, attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "live channel reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// One connection lifetime. Returns how it ended and whether any event got through.
async fn stream_once(
    http: &reqwest::Client,
    url: &str,
    challenge_id: &str,
    tx: &mpsc::Sender<ChannelEvent>,
    last_sent: &mut Option<Value>,
) -> (StreamEnd, bool) {
    let response = match http
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            let status = r.status().as_u16();
            warn!(%challenge_id, status, "live channel rejected");
            let end = if matches!(status, 401 | 403) { StreamEnd::Terminated } else { StreamEnd::Dropped };
            return (end, false);
        }
        Err(e) => {
            warn!(%challenge_id, error = %e, "live channel connect failed");
            return (StreamEnd::Dropped, false);
        }
    };

    debug!(%challenge_id, "live channel connected");
    let mut parser = SseParser::default();
    let mut mirror = Value::Null;
    let mut delivered = false;
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(%challenge_id, error = %e, "live channel stream failed");
                return (StreamEnd::Dropped, delivered);
            }
        };

        let events = match parser.push(&chunk) {
            Ok(events) => events,
            Err(e) => {
                warn!(%challenge_id, error = %e, "live channel frame too large; reconnecting");
                return (StreamEnd::Dropped, delivered);
            }
        };

        for event in events {
            match apply_event(&mut mirror, event) {
                Applied::Changed => {
                    if !is_new_record(&mirror, last_sent.as_ref()) {
                        debug!(%challenge_id, "unchanged record not re-emitted");
                        continue;
                    }
                    match tx.try_send(ChannelEvent::new(challenge_id, mirror.clone())) {
                        Ok(()) => {
                            delivered = true;
                            *last_sent = Some(mirror.clone());
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(%challenge_id, "live channel consumer full; dropping event");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return (StreamEnd::ReceiverGone, delivered),
                    }
                }
                Applied::Ignored => {}
                Applied::Terminate => return (StreamEnd::Terminated, delivered),
            }
        }
    }

    (StreamEnd::Dropped, delivered)
}

/// Whether `mirror` should reach the consumer: not an empty node, and not a
/// repeat of the last record sent (as after a reconnect's initial `put`).
pub(crate) fn is_new_record(mirror: &Value, last_sent: Option<&Value>) -> bool {
    !mirror.is_null() && last_sent != Some(mirror)
}

fn reconnect_delay(attempt: u64) -> Duration {
    let base = attempt.saturating_mul(RECONNECT_BASE_MS).min(RECONNECT_MAX_MS);
    let jitter = rand::rng().random_range(0..=RECONNECT_JITTER_MS);
    Duration::from_millis(base + jitter)
}

// =============================================================================
// SSE PARSING
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseEvent {
    Put { path: String, data: Value },
    Patch { path: String, data: Value },
    KeepAlive,
    Cancel,
    AuthRevoked,
    Unknown(String),
}

#[derive(Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// Incremental `text/event-stream` splitter. Chunks may end mid-frame or
/// mid-codepoint; bytes are buffered until a blank line completes a frame.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a frame end.
    scanned: usize,
}

impl SseParser {
    /// Feed one chunk and return the events it completed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] once an unfinished frame grows past
    /// [`MAX_FRAME_BYTES`]. The parser is unusable afterwards.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, ChatError> {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut events = Vec::new();
        loop {
            // Step back one byte: the previous chunk may have ended on the first '\n'.
            let from = self.scanned.saturating_sub(1);
            let Some(offset) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                break;
            };
            let pos = from + offset;
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.scanned = 0;
            let text = String::from_utf8_lossy(&frame[..pos]);
            if let Some(event) = parse_frame(&text) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_FRAME_BYTES {
            return Err(ChatError::Channel(format!(
                "event stream frame exceeds {MAX_FRAME_BYTES} bytes"
            )));
        }
        Ok(events)
    }
}

pub(crate) fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut name = None;
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    let name = name?;
    let data = data_lines.join("\n");

    Some(match name.as_str() {
        "put" | "patch" => {
            let Ok(body) = serde_json::from_str::<PathData>(&data) else {
                warn!(event = %name, "malformed live channel payload");
                return None;
            };
            if name == "put" {
                SseEvent::Put { path: body.path, data: body.data }
            } else {
                SseEvent::Patch { path: body.path, data: body.data }
            }
        }
        "keep-alive" => SseEvent::KeepAlive,
        "cancel" => SseEvent::Cancel,
        "auth_revoked" => SseEvent::AuthRevoked,
        _ => SseEvent::Unknown(name),
    })
}

// =============================================================================
// MIRROR
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Applied {
    Changed,
    Ignored,
    Terminate,
}

pub(crate) fn apply_event(mirror: &mut Value, event: SseEvent) -> Applied {
    match event {
        SseEvent::Put { path, data } => {
            set_at_path(mirror, &path, data);
            Applied::Changed
        }
        SseEvent::Patch { path, data } => {
            let Value::Object(children) = data else {
                return Applied::Ignored;
            };
            for (key, value) in children {
                set_at_path(mirror, &format!("{}/{key}", path.trim_end_matches('/')), value);
            }
            Applied::Changed
        }
        SseEvent::KeepAlive | SseEvent::Unknown(_) => Applied::Ignored,
        SseEvent::Cancel | SseEvent::AuthRevoked => Applied::Terminate,
    }
}

/// Write `value` at a Firebase-style `/a/b` path, creating objects on the way
/// and deleting the key when `value` is null.
pub(crate) fn set_at_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map.entry((*segment).to_string()).or_insert(Value::Null);
    }

    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else { return };
    if value.is_null() {
        map.remove(*last);
    } else {
        map.insert((*last).to_string(), value);
    }
}

#[cfg(test)]
#[path = "firebase_test.rs"]
mod tests;
