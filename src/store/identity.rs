//! The locally authenticated user, observable by every engine.

use tokio::sync::watch;

use crate::types::UserProfile;

/// Cloneable handle to the current user. `None` means logged out.
#[derive(Clone)]
pub struct Identity {
    tx: watch::Sender<Option<UserProfile>>,
}

impl Identity {
    #[must_use]
    pub fn new(user: Option<UserProfile>) -> Self {
        let (tx, _) = watch::channel(user);
        Self { tx }
    }

    pub fn set_user(&self, user: UserProfile) {
        self.tx.send_replace(Some(user));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    #[must_use]
    pub fn current(&self) -> Option<UserProfile> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<UserProfile>> {
        self.tx.subscribe()
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
