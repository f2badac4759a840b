//! Client engines that sit between the views and the remote services.
//!
//! ARCHITECTURE
//! ============
//! - `messages`: pagination and optimistic send for the open challenge
//! - `updates`: per-challenge live subscriptions coalesced into forced
//!   refreshes of the challenge list
//! - `unread`: per-challenge unread tallies against the last-seen store
//!
//! `updates` and `unread` each own a `registry::SubscriptionRegistry` and
//! subscribe independently; neither sees the other's handles.

pub mod messages;
pub mod registry;
pub mod unread;
pub mod updates;

pub use messages::{FetchOutcome, MessageEngine, PaginationState};
pub use registry::{ChannelState, SubscriptionRegistry, SyncPlan};
pub use unread::{UnreadAggregator, UnreadCounts};
pub use updates::{DebounceController, UpdateCoordinator};
