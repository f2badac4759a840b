use super::*;
use crate::error::ChatError;
use crate::realtime::LocalChannel;
use crate::types::ChallengeStatus;
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use tokio::sync::Semaphore;
use tokio::time::sleep;

const DEBOUNCE: Duration = Duration::from_millis(500);

// =========================================================================
// MockSource
// =========================================================================

#[derive(Default)]
struct MockSource {
    calls: AtomicUsize,
    forced: AtomicUsize,
    fail: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockSource {
    fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChallengeSource for MockSource {
    async fn fetch_challenges(&self, force: bool) -> Result<Vec<Challenge>, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if force {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::Network("unreachable".into()));
        }
        Ok(Vec::new())
    }
}

fn setup() -> (UpdateCoordinator, LocalChannel, Arc<MockSource>) {
    let channel = LocalChannel::new();
    let source = Arc::new(MockSource::default());
    let coordinator = UpdateCoordinator::new(Arc::new(channel.clone()), source.clone(), DEBOUNCE);
    (coordinator, channel, source)
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn challenge(id: &str) -> Challenge {
    Challenge {
        id: id.into(),
        title: id.to_uppercase(),
        status: ChallengeStatus::Ongoing,
        last_message_at: None,
        participant_count: None,
    }
}

fn activity(channel: &LocalChannel, id: &str, timestamp: i64) {
    channel.publish(id, json!({ "timestamp": timestamp, "senderId": "u2" }));
}

// =========================================================================
// Debounce
// =========================================================================

#[tokio::test(start_paused = true)]
async fn burst_of_events_triggers_one_refresh() {
    let (coordinator, channel, source) = setup();
    coordinator.sync(&ids(&["c1"]));

    for ts in 1..=10 {
        activity(&channel, "c1", ts);
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(source.calls(), 0);
    assert_eq!(coordinator.pending_timers(), 1);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(source.forced.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.refresh_count(), 1);
    assert_eq!(coordinator.last_applied("c1"), Some(10));
    assert_eq!(coordinator.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_event_triggers_nothing() {
    let (coordinator, channel, source) = setup();
    coordinator.sync(&ids(&["c1"]));

    activity(&channel, "c1", 5);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(source.calls(), 1);

    activity(&channel, "c1", 5);
    activity(&channel, "c1", 3);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(coordinator.pending_timers(), 0);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(coordinator.last_applied("c1"), Some(5));
}

#[tokio::test(start_paused = true)]
async fn events_during_refresh_are_dropped() {
    let (coordinator, channel, source) = setup();
    let gate = source.gate();
    coordinator.sync(&ids(&["c1"]));

    activity(&channel, "c1", 1);
    sleep(Duration::from_millis(600)).await;
    assert!(coordinator.is_refreshing());

    activity(&channel, "c1", 2);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(coordinator.pending_timers(), 0);
    assert_eq!(source.calls(), 1);

    gate.add_permits(1);
    sleep(Duration::from_millis(1)).await;
    assert!(!coordinator.is_refreshing());

    gate.add_permits(1);
    activity(&channel, "c1", 3);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(source.calls(), 2);
    assert_eq!(coordinator.last_applied("c1"), Some(3));
}

#[tokio::test(start_paused = true)]
async fn refresh_is_single_flight_across_channels() {
    let (coordinator, channel, source) = setup();
    let gate = source.gate();
    coordinator.sync(&ids(&["c1", "c2"]));

    activity(&channel, "c1", 1);
    activity(&channel, "c2", 1);
    sleep(Duration::from_millis(600)).await;

    assert_eq!(source.calls(), 1);
    assert_eq!(coordinator.refresh_count(), 1);
    gate.add_permits(1);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_clears_flag_without_retry() {
    let (coordinator, channel, source) = setup();
    source.fail.store(true, Ordering::SeqCst);
    coordinator.sync(&ids(&["c1"]));

    activity(&channel, "c1", 1);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(source.calls(), 1);
    assert!(!coordinator.is_refreshing());

    sleep(Duration::from_secs(5)).await;
    assert_eq!(source.calls(), 1);

    activity(&channel, "c1", 2);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(source.calls(), 2);
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test(start_paused = true)]
async fn removed_channel_releases_subscription_and_timer() {
    let (coordinator, channel, source) = setup();
    coordinator.sync(&ids(&["c1", "c2"]));

    activity(&channel, "c1", 1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.pending_timers(), 1);

    coordinator.sync(&ids(&["c2"]));
    assert_eq!(coordinator.subscribed(), ids(&["c2"]));
    assert_eq!(channel.subscriber_count("c1"), 0);
    assert_eq!(coordinator.pending_timers(), 0);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.calls(), 0);
    assert_eq!(channel.publish("c1", json!({ "timestamp": 2 })), 0);
}

#[tokio::test(start_paused = true)]
async fn resync_keeps_live_subscriptions() {
    let (coordinator, channel, _source) = setup();
    coordinator.sync(&ids(&["c1"]));
    coordinator.sync(&ids(&["c1", "c2"]));
    coordinator.sync(&ids(&["c2", "c1", "c1"]));

    assert_eq!(channel.subscriptions_opened(), 2);
    assert_eq!(channel.subscriber_count("c1"), 1);
    assert_eq!(channel.subscriber_count("c2"), 1);
}

#[tokio::test(start_paused = true)]
async fn close_releases_everything_and_nothing_fires() {
    let (coordinator, channel, source) = setup();
    coordinator.sync(&ids(&["c1", "c2"]));
    activity(&channel, "c1", 1);
    activity(&channel, "c2", 1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.pending_timers(), 2);

    coordinator.close();
    assert!(coordinator.subscribed().is_empty());
    assert_eq!(channel.subscriber_count("c1"), 0);
    assert_eq!(channel.subscriber_count("c2"), 0);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_coordinator_fires_nothing() {
    let (coordinator, channel, source) = setup();
    coordinator.sync(&ids(&["c1"]));
    activity(&channel, "c1", 1);
    sleep(Duration::from_millis(100)).await;

    drop(coordinator);
    assert_eq!(channel.subscriber_count("c1"), 0);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn watch_ongoing_follows_challenge_set() {
    let (coordinator, channel, _source) = setup();
    let (tx, rx) = watch::channel(vec![challenge("a")]);
    coordinator.watch_ongoing(rx);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(coordinator.subscribed(), ids(&["a"]));

    tx.send(vec![challenge("b"), challenge("c")]).unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(coordinator.subscribed(), ids(&["b", "c"]));
    assert_eq!(channel.subscriber_count("a"), 0);

    coordinator.close();
    tx.send_replace(vec![challenge("d")]);
    sleep(Duration::from_millis(1)).await;
    assert!(coordinator.subscribed().is_empty());
}
