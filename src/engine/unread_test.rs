use super::*;
use crate::realtime::LocalChannel;
use crate::store::Identity;
use crate::types::ChallengeStatus;
use serde_json::json;
use std::time::Duration;

fn user(id: &str) -> UserProfile {
    UserProfile { id: id.into(), first_name: None, last_name: None, avatar_url: None }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn challenge(id: &str) -> Challenge {
    Challenge { id: id.into(), title: String::new(), status: ChallengeStatus::Ongoing, last_message_at: None, participant_count: None }
}

fn setup() -> (UnreadAggregator, LocalChannel, LastSeenStore) {
    let channel = LocalChannel::new();
    let last_seen = LastSeenStore::in_memory();
    let aggregator = UnreadAggregator::spawn(Arc::new(channel.clone()), last_seen.clone());
    (aggregator, channel, last_seen)
}

fn activity(channel: &LocalChannel, id: &str, timestamp: i64, sender: &str) {
    channel.publish(id, json!({ "timestamp": timestamp, "senderId": sender }));
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// =========================================================================
// Counting
// =========================================================================

#[tokio::test(start_paused = true)]
async fn counts_events_newer_than_last_seen() {
    let (aggregator, channel, last_seen) = setup();
    last_seen.set("c1", 100).unwrap();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));

    activity(&channel, "c1", 90, "u2");
    settle().await;
    assert_eq!(aggregator.current().get("c1"), 0);

    for ts in [101, 102, 103] {
        activity(&channel, "c1", ts, "u2");
    }
    settle().await;
    let counts = aggregator.current();
    assert_eq!(counts.get("c1"), 3);
    assert_eq!(counts.total, 3);
}

#[tokio::test(start_paused = true)]
async fn never_seen_challenge_counts_every_event() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));

    activity(&channel, "c1", 1, "u2");
    activity(&channel, "c1", 2, "u3");
    settle().await;
    assert_eq!(aggregator.current().get("c1"), 2);
}

#[tokio::test(start_paused = true)]
async fn marking_seen_drops_count_to_zero() {
    let (aggregator, channel, last_seen) = setup();
    last_seen.set("c1", 100).unwrap();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));
    activity(&channel, "c1", 101, "u2");
    activity(&channel, "c1", 102, "u2");
    settle().await;
    assert_eq!(aggregator.current().total, 2);

    let mut counts = aggregator.counts();
    let _ = counts.borrow_and_update();
    last_seen.mark_seen("c1").unwrap();
    counts.changed().await.unwrap();

    let counts = aggregator.current();
    assert_eq!(counts.get("c1"), 0);
    assert_eq!(counts.total, 0);
    assert!(counts.per_challenge.contains_key("c1"));
}

#[tokio::test(start_paused = true)]
async fn stale_event_changes_nothing() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));
    activity(&channel, "c1", 5, "u2");
    settle().await;
    assert_eq!(aggregator.current().get("c1"), 1);

    let mut counts = aggregator.counts();
    let _ = counts.borrow_and_update();
    activity(&channel, "c1", 5, "u2");
    activity(&channel, "c1", 4, "u2");
    settle().await;
    assert!(!counts.has_changed().unwrap());
    assert_eq!(aggregator.current().get("c1"), 1);
}

#[tokio::test(start_paused = true)]
async fn own_activity_is_not_unread() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));

    activity(&channel, "c1", 10, "u1");
    settle().await;
    assert_eq!(aggregator.current().get("c1"), 0);

    // Applied even though not counted: an older foreign event stays stale.
    activity(&channel, "c1", 9, "u2");
    settle().await;
    assert_eq!(aggregator.current().get("c1"), 0);
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test(start_paused = true)]
async fn total_follows_subscribed_set() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1", "c2"]));
    activity(&channel, "c1", 1, "u2");
    activity(&channel, "c1", 2, "u2");
    activity(&channel, "c2", 1, "u2");
    settle().await;
    assert_eq!(aggregator.current().total, 3);

    aggregator.sync(Some(&user("u1")), &ids(&["c2"]));
    let counts = aggregator.current();
    assert_eq!(counts.total, 1);
    assert!(!counts.per_challenge.contains_key("c1"));
    assert_eq!(channel.subscriber_count("c1"), 0);

    activity(&channel, "c1", 3, "u2");
    settle().await;
    assert_eq!(aggregator.current().total, 1);
}

#[tokio::test(start_paused = true)]
async fn no_user_clears_counts_and_subscriptions() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));
    activity(&channel, "c1", 1, "u2");
    settle().await;
    assert_eq!(aggregator.current().total, 1);

    aggregator.sync(None, &ids(&["c1"]));
    assert_eq!(aggregator.current(), UnreadCounts::default());
    assert_eq!(channel.subscriber_count("c1"), 0);
}

#[tokio::test(start_paused = true)]
async fn switching_user_starts_fresh() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1"]));
    activity(&channel, "c1", 1, "u2");
    settle().await;
    assert_eq!(aggregator.current().total, 1);

    aggregator.sync(Some(&user("u2")), &ids(&["c1"]));
    assert_eq!(aggregator.current().total, 0);
    assert_eq!(channel.subscriptions_opened(), 2);
    assert_eq!(channel.subscriber_count("c1"), 1);
}

#[tokio::test(start_paused = true)]
async fn follow_tracks_identity_and_ongoing_set() {
    let (aggregator, channel, _last_seen) = setup();
    let identity = Identity::default();
    let (ongoing_tx, ongoing_rx) = watch::channel(vec![challenge("c1")]);
    aggregator.follow(identity.subscribe(), ongoing_rx);
    settle().await;
    assert_eq!(channel.subscriber_count("c1"), 0);

    identity.set_user(user("u1"));
    settle().await;
    assert_eq!(channel.subscriber_count("c1"), 1);

    ongoing_tx.send(vec![challenge("c2")]).unwrap();
    settle().await;
    assert_eq!(channel.subscriber_count("c1"), 0);
    assert_eq!(channel.subscriber_count("c2"), 1);

    identity.clear();
    settle().await;
    assert_eq!(channel.subscriber_count("c2"), 0);
}

#[tokio::test(start_paused = true)]
async fn close_releases_everything() {
    let (aggregator, channel, _last_seen) = setup();
    aggregator.sync(Some(&user("u1")), &ids(&["c1", "c2"]));
    activity(&channel, "c1", 1, "u2");
    settle().await;

    aggregator.close();
    assert_eq!(channel.subscriber_count("c1"), 0);
    assert_eq!(channel.subscriber_count("c2"), 0);
    assert_eq!(aggregator.current(), UnreadCounts::default());

    activity(&channel, "c1", 2, "u2");
    settle().await;
    assert_eq!(aggregator.current().total, 0);
}
