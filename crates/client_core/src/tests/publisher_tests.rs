use super::*;
use crate::test_support::{identity, FakeStore};
use shared::domain::UserId;

fn publisher(store: &Arc<FakeStore>) -> (RequestPublisher, broadcast::Receiver<ClientEvent>) {
    let (events, rx) = broadcast::channel(16);
    (RequestPublisher::new(store.clone(), events), rx)
}

fn alice_session() -> Session {
    Session::authenticated(&identity(1, "alice@example.com"))
}

#[tokio::test]
async fn anonymous_publish_never_reaches_store() {
    let store = FakeStore::new();
    let (publisher, _events) = publisher(&store);
    let mut form = RideRequestForm::new("5th Ave", "Airport");

    let err = publisher
        .publish(&mut form, &Session::anonymous())
        .await
        .unwrap_err();

    assert_eq!(err, PublishError::NotAuthenticated);
    assert_eq!(store.pushes(), 0);
    assert_eq!(form, RideRequestForm::new("5th Ave", "Airport"));
}

#[tokio::test]
async fn blank_fields_are_rejected_before_store() {
    let store = FakeStore::new();
    let (publisher, _events) = publisher(&store);
    let session = alice_session();

    let cases = [
        ("", "Airport", "pickup_location"),
        ("   ", "Airport", "pickup_location"),
        ("5th Ave", "", "dropoff_location"),
        ("5th Ave", "\t", "dropoff_location"),
        ("", "", "pickup_location"),
    ];
    for (pickup, dropoff, field) in cases {
        let mut form = RideRequestForm::new(pickup, dropoff);
        let err = publisher.publish(&mut form, &session).await.unwrap_err();
        assert_eq!(err, PublishError::InvalidInput { field });
        assert_eq!(form.pickup_location, pickup);
        assert_eq!(form.dropoff_location, dropoff);
    }
    assert_eq!(store.pushes(), 0);
}

#[tokio::test]
async fn missing_identity_is_reported_before_blank_fields() {
    let store = FakeStore::new();
    let (publisher, _events) = publisher(&store);
    let mut form = RideRequestForm::default();

    let err = publisher
        .publish(&mut form, &Session::anonymous())
        .await
        .unwrap_err();
    assert_eq!(err, PublishError::NotAuthenticated);
}

#[tokio::test]
async fn successful_publish_appends_once_and_clears_form() {
    let store = FakeStore::new();
    let (publisher, _events) = publisher(&store);
    let mut form = RideRequestForm::new("  5th Ave ", "Airport");

    publisher.publish(&mut form, &alice_session()).await.unwrap();

    assert_eq!(store.pushes(), 1);
    assert_eq!(form, RideRequestForm::default());
    let entries = store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].author, UserId(1));
    assert_eq!(entries[0].pickup_location, "5th Ave");
    assert_eq!(entries[0].dropoff_location, "Airport");
}

#[tokio::test]
async fn store_failure_keeps_form_and_is_not_retried() {
    let store = FakeStore::new();
    store.set_fail_push(true);
    let (publisher, mut events) = publisher(&store);
    let mut form = RideRequestForm::new("5th Ave", "Airport");

    let err = publisher.publish(&mut form, &alice_session()).await.unwrap_err();

    assert!(matches!(err, PublishError::Store(message) if message.contains("store offline")));
    assert_eq!(store.pushes(), 1);
    assert_eq!(form, RideRequestForm::new("5th Ave", "Airport"));
    assert!(matches!(
        events.try_recv(),
        Ok(ClientEvent::Error(message)) if message.starts_with("publish failed")
    ));
}

#[tokio::test]
async fn repeated_publishes_produce_distinct_entries() {
    let store = FakeStore::new();
    let (publisher, _events) = publisher(&store);
    let session = alice_session();

    for _ in 0..2 {
        let mut form = RideRequestForm::new("5th Ave", "Airport");
        publisher.publish(&mut form, &session).await.unwrap();
    }

    let entries = store.entries();
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].id, entries[1].id);
}
