//! Durable and session-scoped client stores.

pub mod challenges;
pub mod identity;
pub mod last_seen;

pub use challenges::{ChallengeSource, ChallengeStore};
pub use identity::Identity;
pub use last_seen::{FileBackend, LastSeenBackend, LastSeenStore, MemoryBackend};
