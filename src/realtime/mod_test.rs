use super::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

// =============================================================================
// ChannelEvent timestamps
// =============================================================================

#[test]
fn explicit_timestamp_prefers_timestamp_field() {
    let event = ChannelEvent::new("c1", json!({ "timestamp": 5, "lastMessageAt": 9 }));
    assert_eq!(event.explicit_timestamp(), Some(5));
}

#[test]
fn explicit_timestamp_falls_through_field_order() {
    let event = ChannelEvent::new("c1", json!({ "updatedAt": 7, "lastMessageAt": 9 }));
    assert_eq!(event.explicit_timestamp(), Some(9));
}

#[test]
fn float_timestamps_are_truncated() {
    let event = ChannelEvent::new("c1", json!({ "timestamp": 1_700_000_000_123.9 }));
    assert_eq!(event.explicit_timestamp(), Some(1_700_000_000_123));
}

#[test]
fn effective_timestamp_falls_back_to_observation_time() {
    let mut event = ChannelEvent::new("c1", json!({ "type": "message" }));
    event.observed_at = 42;
    assert_eq!(event.explicit_timestamp(), None);
    assert_eq!(event.effective_timestamp(), 42);
}

#[test]
fn sender_id_reads_either_field() {
    assert_eq!(ChannelEvent::new("c", json!({ "senderId": "u1" })).sender_id(), Some("u1"));
    assert_eq!(ChannelEvent::new("c", json!({ "lastSenderId": "u2" })).sender_id(), Some("u2"));
    assert_eq!(ChannelEvent::new("c", json!(null)).sender_id(), None);
}

// =============================================================================
// SubscriptionHandle
// =============================================================================

#[test]
fn unsubscribe_is_idempotent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = SubscriptionHandle::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(handle.is_active());
    handle.unsubscribe();
    handle.unsubscribe();
    assert!(!handle.is_active());
    drop(handle);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn drop_releases_listener() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    drop(SubscriptionHandle::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
