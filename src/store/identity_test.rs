use super::*;

fn profile(id: &str) -> UserProfile {
    UserProfile { id: id.into(), first_name: Some("Grace".into()), last_name: Some("Hopper".into()), avatar_url: None }
}

#[test]
fn starts_with_given_user() {
    assert!(Identity::default().current().is_none());
    assert_eq!(Identity::new(Some(profile("u1"))).current().map(|u| u.id), Some("u1".into()));
}

#[tokio::test]
async fn subscribers_see_sign_in_and_sign_out() {
    let identity = Identity::default();
    let mut rx = identity.subscribe();

    identity.set_user(profile("u1"));
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().as_ref().map(|u| u.id.clone()), Some("u1".into()));

    identity.clear();
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().is_none());
}

#[test]
fn clones_share_state() {
    let identity = Identity::default();
    let other = identity.clone();
    other.set_user(profile("u2"));
    assert_eq!(identity.current().unwrap().last_name.as_deref(), Some("Hopper"));
}
