//! RequestGateway against a mock backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use mockito::{Matcher, Server};
use porter_auth_core::api::ApiError;
use porter_auth_core::auth::credentials::ACCESS_TOKEN_KEY;
use porter_auth_core::storage::{DurableStorage, MemoryStorage, StorageResult};
use porter_auth_core::{CredentialStore, RequestGateway, UserProfile};

/// Memory storage that counts how often the access token is removed.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryStorage,
    token_removals: AtomicUsize,
}

impl DurableStorage for CountingStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        if key == ACCESS_TOKEN_KEY {
            self.token_removals.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.remove(key)
    }
}

fn signed_in(store: &CredentialStore, token: &str, refresh: Option<&str>) {
    store
        .persist_session(token, refresh, &UserProfile::new(1, "e@x.com"))
        .unwrap();
}

#[tokio::test]
async fn test_bearer_header_follows_the_store() {
    let mut server = Server::new_async().await;
    let store = CredentialStore::new(MemoryStorage::new());
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();

    let anonymous = server
        .mock("GET", "/auth/verify")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .expect(2)
        .create_async()
        .await;
    gateway.verify().await.unwrap();

    signed_in(&store, "t1", None);
    let authorized = server
        .mock("GET", "/auth/verify")
        .match_header("authorization", "Bearer t1")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    gateway.verify().await.unwrap();

    // The very next call after clear goes out without a header
    store.clear();
    gateway.verify().await.unwrap();

    anonymous.assert_async().await;
    authorized.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_unauthorized_clears_once() {
    let mut server = Server::new_async().await;
    let storage = Arc::new(CountingStorage::default());
    let store = CredentialStore::new(Arc::clone(&storage));
    signed_in(&store, "t1", Some("r1"));

    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    gateway.add_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mock = server
        .mock("GET", "/projects")
        .with_status(401)
        .expect(4)
        .create_async()
        .await;

    let results = join_all((0..4).map(|_| gateway.get::<serde_json::Value>("/projects"))).await;

    mock.assert_async().await;
    for result in results {
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<ApiError>().is_some_and(ApiError::is_unauthorized));
    }
    assert_eq!(storage.token_removals.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(!store.has_token());
    assert!(store.refresh_token().is_none());
    assert!(store.user_profile().is_none());
}

#[tokio::test]
async fn test_rejection_carries_server_message() {
    let mut server = Server::new_async().await;
    let gateway =
        RequestGateway::new(server.url(), CredentialStore::new(MemoryStorage::new())).unwrap();

    server
        .mock("POST", "/auth/signup")
        .with_status(409)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":409,"message":"Email already registered"}"#)
        .create_async()
        .await;

    let err = gateway.signup("e@x.com", "Secret1!", "E").await.unwrap_err();
    match err.downcast_ref::<ApiError>() {
        Some(ApiError::Rejected { status, message }) => {
            assert_eq!(*status, 409);
            assert_eq!(message, "Email already registered");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_refresh_stores_new_token() {
    let mut server = Server::new_async().await;
    let store = CredentialStore::new(MemoryStorage::new());
    signed_in(&store, "t1", Some("r1"));
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();

    let mock = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(serde_json::json!({ "refreshToken": "r1" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"t2"}"#)
        .expect(1)
        .create_async()
        .await;

    assert_eq!(gateway.refresh_token().await.unwrap(), "t2");
    mock.assert_async().await;
    assert_eq!(store.access_token().as_deref(), Some("t2"));
    assert_eq!(store.refresh_token().as_deref(), Some("r1"));
}

#[tokio::test]
async fn test_refresh_is_single_flight() {
    let mut server = Server::new_async().await;
    let store = CredentialStore::new(MemoryStorage::new());
    signed_in(&store, "t1", Some("r1"));
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();

    let mock = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"t2"}"#)
        .expect(1)
        .create_async()
        .await;

    let (first, second) = tokio::join!(gateway.refresh_token(), gateway.refresh_token());

    mock.assert_async().await;
    assert_eq!(first.unwrap(), "t2");
    let err = second.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::RefreshInFlight)
    ));
}

#[tokio::test]
async fn test_refresh_without_refresh_token_skips_network() {
    let mut server = Server::new_async().await;
    let store = CredentialStore::new(MemoryStorage::new());
    signed_in(&store, "t1", None);
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();

    let mock = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;

    let err = gateway.refresh_token().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::NoRefreshToken)
    ));
    mock.assert_async().await;
    assert!(store.has_token());
}

#[tokio::test]
async fn test_rejected_refresh_ends_session() {
    let mut server = Server::new_async().await;
    let store = CredentialStore::new(MemoryStorage::new());
    signed_in(&store, "t1", Some("r1"));
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    gateway.add_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    server
        .mock("POST", "/auth/refresh")
        .with_status(400)
        .with_body(r#"{"status":400,"message":"Refresh token revoked"}"#)
        .create_async()
        .await;

    assert!(gateway.refresh_token().await.is_err());
    assert!(!store.has_token());
    assert!(store.refresh_token().is_none());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refresh_server_error_keeps_session() {
    let mut server = Server::new_async().await;
    let store = CredentialStore::new(MemoryStorage::new());
    signed_in(&store, "t1", Some("r1"));
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();

    server
        .mock("POST", "/auth/refresh")
        .with_status(503)
        .create_async()
        .await;

    let err = gateway.refresh_token().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::ServerError(_))
    ));
    assert_eq!(store.access_token().as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_refresh_finishing_after_clear_stores_nothing() {
    let mut server = Server::new_async().await;
    let storage = Arc::new(CountingStorage::default());
    let store = CredentialStore::new(Arc::clone(&storage));
    signed_in(&store, "t1", Some("r1"));
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();

    server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"t2"}"#)
        .create_async()
        .await;

    // The refresh is on the wire when the session is cleared
    let (refreshed, ()) = tokio::join!(gateway.refresh_token(), async { store.clear() });

    let err = refreshed.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::SessionChanged)
    ));
    assert_eq!(store.access_token(), None);
    store.invalidate_cache();
    assert_eq!(store.access_token(), None);
    assert!(storage.inner.is_empty());
}

#[tokio::test]
async fn test_unauthorized_refresh_clears_once_without_retry() {
    let mut server = Server::new_async().await;
    let storage = Arc::new(CountingStorage::default());
    let store = CredentialStore::new(Arc::clone(&storage));
    signed_in(&store, "t1", Some("r1"));
    let gateway = RequestGateway::new(server.url(), store.clone()).unwrap();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    gateway.add_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mock = server
        .mock("POST", "/auth/refresh")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let err = gateway.refresh_token().await.unwrap_err();
    assert!(err.downcast_ref::<ApiError>().is_some_and(ApiError::is_unauthorized));

    // Nothing left to refresh with, so a second attempt stays local
    let err = gateway.refresh_token().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::NoRefreshToken)
    ));

    mock.assert_async().await;
    assert_eq!(storage.token_removals.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(!store.has_token());
}
