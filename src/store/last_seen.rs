//! Persisted last-seen timestamps, keyed by challenge id.
//!
//! DESIGN
//! ======
//! `LastSeenStore` keeps the whole map in memory and writes through to a
//! `LastSeenBackend` on every change. The file backend writes a JSON object
//! to a temp file and renames it over the target so a crash mid-write never
//! leaves a truncated map behind.
//!
//! Writes are monotonic per challenge: an older timestamp never replaces a
//! newer one, so a slow writer cannot resurrect unread counts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::ChatError;
use crate::types::now_ms;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub type LastSeenMap = HashMap<String, i64>;

/// Storage for the last-seen map.
pub trait LastSeenBackend: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] if the map cannot be read.
    fn load(&self) -> Result<LastSeenMap, ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] if the map cannot be written.
    fn save(&self, map: &LastSeenMap) -> Result<(), ChatError>;
}

// =============================================================================
// BACKENDS
// =============================================================================

/// JSON file backend.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LastSeenBackend for FileBackend {
    fn load(&self) -> Result<LastSeenMap, ChatError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .map_err(|e| ChatError::Storage(format!("corrupt last-seen file: {e}")))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LastSeenMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, map: &LastSeenMap) -> Result<(), ChatError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(map).map_err(|e| ChatError::Storage(e.to_string()))?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, &bytes)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// Non-durable backend for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBackend {
    map: Mutex<LastSeenMap>,
}

impl LastSeenBackend for MemoryBackend {
    fn load(&self) -> Result<LastSeenMap, ChatError> {
        Ok(self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }

    fn save(&self, map: &LastSeenMap) -> Result<(), ChatError> {
        *self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = map.clone();
        Ok(())
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Shared handle to the last-seen map. Clones observe the same state.
#[derive(Clone)]
pub struct LastSeenStore {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Box<dyn LastSeenBackend>,
    map: Mutex<LastSeenMap>,
    changes: broadcast::Sender<(String, i64)>,
}

impl LastSeenStore {
    /// Load the persisted map. A corrupt or unreadable file starts empty.
    #[must_use]
    pub fn open(backend: Box<dyn LastSeenBackend>) -> Self {
        let map = backend.load().unwrap_or_else(|e| {
            warn!(error = %e, "last-seen store unreadable; starting empty");
            LastSeenMap::new()
        });
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { inner: Arc::new(Inner { backend, map: Mutex::new(map), changes }) }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryBackend::default()))
    }

    #[must_use]
    pub fn get(&self, challenge_id: &str) -> Option<i64> {
        self.lock().get(challenge_id).copied()
    }

    /// Record that the viewer opened `challenge_id` now.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] if the backend write fails. The
    /// in-memory value is updated regardless.
    pub fn mark_seen(&self, challenge_id: &str) -> Result<i64, ChatError> {
        let now = now_ms();
        self.set(challenge_id, now)?;
        Ok(now)
    }

    /// [`mark_seen`](Self::mark_seen) on the blocking pool, for callers on the
    /// async runtime. The backend write does file I/O under the map lock.
    ///
    /// # Errors
    ///
    /// As [`mark_seen`](Self::mark_seen); a panicked write is
    /// [`ChatError::Storage`].
    pub async fn mark_seen_async(&self, challenge_id: &str) -> Result<i64, ChatError> {
        let store = self.clone();
        let challenge_id = challenge_id.to_string();
        tokio::task::spawn_blocking(move || store.mark_seen(&challenge_id))
            .await
            .map_err(|e| ChatError::Storage(format!("last-seen write task failed: {e}")))?
    }

    /// Set the timestamp for `challenge_id`. Returns whether the value changed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] if the backend write fails.
    pub fn set(&self, challenge_id: &str, timestamp: i64) -> Result<bool, ChatError> {
        let saved = {
            let mut map = self.lock();
            // EDGE: never move a challenge's last-seen backwards.
            if map.get(challenge_id).is_some_and(|&current| current >= timestamp) {
                return Ok(false);
            }
            map.insert(challenge_id.to_string(), timestamp);
            // Saved under the lock so file order matches memory order.
            self.inner.backend.save(&map)
        };

        // Receivers may all be gone; that is not an error.
        let _ = self.inner.changes.send((challenge_id.to_string(), timestamp));

        saved.map(|()| true)
    }

    /// Change feed of `(challenge_id, timestamp)` writes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<(String, i64)> {
        self.inner.changes.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LastSeenMap> {
        self.inner.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "last_seen_test.rs"]
mod tests;
