//! Challenge chat client core: paginated message history with optimistic
//! sends, live challenge updates coalesced into list refreshes, and unread
//! counts driven by a persisted last-seen map.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod realtime;
pub mod store;
pub mod types;

pub use config::ChatConfig;
pub use error::ChatError;
