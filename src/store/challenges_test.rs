use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// MockChallengeApi
// =============================================================================

struct MockChallengeApi {
    calls: AtomicUsize,
    responses: std::sync::Mutex<Vec<Result<Vec<Challenge>, ChatError>>>,
}

impl MockChallengeApi {
    fn new(responses: Vec<Result<Vec<Challenge>, ChatError>>) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), responses: std::sync::Mutex::new(responses) })
    }
}

#[async_trait::async_trait]
impl ChallengeApi for MockChallengeApi {
    async fn fetch_ongoing(&self) -> Result<Vec<Challenge>, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() { Ok(Vec::new()) } else { responses.remove(0) }
    }
}

fn challenge(id: &str, status: ChallengeStatus) -> Challenge {
    Challenge { id: id.into(), title: format!("challenge {id}"), status, last_message_at: None, participant_count: None }
}

// =============================================================================
// fetch_challenges
// =============================================================================

#[tokio::test(start_paused = true)]
async fn cached_result_served_within_ttl() {
    let api = MockChallengeApi::new(vec![Ok(vec![challenge("c1", ChallengeStatus::Ongoing)])]);
    let store = ChallengeStore::new(api.clone(), Duration::from_secs(30));

    let first = store.fetch_challenges(false).await.unwrap();
    let second = store.fetch_challenges(false).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cache_expires_after_ttl() {
    let api = MockChallengeApi::new(vec![Ok(vec![]), Ok(vec![])]);
    let store = ChallengeStore::new(api.clone(), Duration::from_secs(30));

    store.fetch_challenges(false).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    store.fetch_challenges(false).await.unwrap();
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn force_bypasses_cache() {
    let api = MockChallengeApi::new(vec![Ok(vec![]), Ok(vec![])]);
    let store = ChallengeStore::new(api.clone(), Duration::from_secs(30));

    store.fetch_challenges(false).await.unwrap();
    store.fetch_challenges(true).await.unwrap();
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn only_ongoing_challenges_are_published() {
    let api = MockChallengeApi::new(vec![Ok(vec![
        challenge("c1", ChallengeStatus::Ongoing),
        challenge("c2", ChallengeStatus::Ended),
        challenge("c3", ChallengeStatus::Upcoming),
    ])]);
    let store = ChallengeStore::new(api, Duration::from_secs(30));
    let mut rx = store.ongoing();

    let fetched = store.fetch_challenges(true).await.unwrap();
    assert_eq!(challenge_ids(&fetched), ["c1"]);
    assert!(rx.has_changed().unwrap());
    assert_eq!(challenge_ids(&rx.borrow_and_update()), ["c1"]);
}

#[tokio::test]
async fn unchanged_set_does_not_notify() {
    let api = MockChallengeApi::new(vec![
        Ok(vec![challenge("c1", ChallengeStatus::Ongoing)]),
        Ok(vec![challenge("c1", ChallengeStatus::Ongoing)]),
    ]);
    let store = ChallengeStore::new(api, Duration::from_secs(30));
    let mut rx = store.ongoing();

    store.fetch_challenges(true).await.unwrap();
    rx.borrow_and_update();
    store.fetch_challenges(true).await.unwrap();
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn failed_fetch_keeps_previous_set() {
    let api = MockChallengeApi::new(vec![
        Ok(vec![challenge("c1", ChallengeStatus::Ongoing)]),
        Err(ChatError::Network("offline".into())),
    ]);
    let store = ChallengeStore::new(api, Duration::from_secs(30));

    store.fetch_challenges(true).await.unwrap();
    assert!(store.fetch_challenges(true).await.is_err());
    assert_eq!(challenge_ids(&store.current()), ["c1"]);
}

#[test]
fn challenge_ids_dedupes_in_order() {
    let list = vec![
        challenge("b", ChallengeStatus::Ongoing),
        challenge("a", ChallengeStatus::Ongoing),
        challenge("b", ChallengeStatus::Ongoing),
    ];
    assert_eq!(challenge_ids(&list), ["b", "a"]);
}
