//! Credential cache tests against a mock token endpoint.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use vox_realtime::{Credential, CredentialCache, CredentialError, CredentialSource, HttpCredentialSource};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn token_response(token: &str, expires_in: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": token,
        "expires_in": expires_in,
        "model_id": "gemini-live-001",
        "project_id": "acme"
    }))
}

fn cache_for(server: &MockServer) -> CredentialCache {
    let source = HttpCredentialSource::new(format!("{}/token", server.uri()), Some("api-key".into()))
        .with_location("us-central1");
    CredentialCache::new(Arc::new(source), "gemini-live")
}

#[tokio::test]
async fn test_concurrent_callers_share_one_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("authorization", "Bearer api-key"))
        .and(body_json(json!({"model": "gemini-live"})))
        .respond_with(token_response("t1", 3600).set_delay(std::time::Duration::from_millis(100)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    let results = futures::future::join_all((0..8).map(|_| cache.get_valid_token())).await;

    for result in results {
        let credential = result.unwrap();
        assert_eq!(credential.token, "t1");
        assert_eq!(credential.model, "projects/acme/locations/us-central1/publishers/google/models/gemini-live-001");
    }
    assert_eq!(cache.fetch_count(), 1);

    // Fresh credentials are served from the cache.
    assert_eq!(cache.get_valid_token().await.unwrap().token, "t1");
    assert_eq!(cache.fetch_count(), 1);
}

#[tokio::test]
async fn test_refreshes_inside_safety_margin() {
    let server = MockServer::start().await;
    // Four minutes of validity is inside the five minute margin.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("short", 240))
        .expect(2)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    cache.get_valid_token().await.unwrap();
    cache.get_valid_token().await.unwrap();
    assert_eq!(cache.fetch_count(), 2);
}

#[tokio::test]
async fn test_custom_margin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("short", 240))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_for(&server).with_safety_margin(Duration::seconds(60));
    cache.get_valid_token().await.unwrap();
    cache.get_valid_token().await.unwrap();
    assert_eq!(cache.fetch_count(), 1);
}

#[tokio::test]
async fn test_clear_cache_forces_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("t", 3600))
        .expect(2)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    cache.get_valid_token().await.unwrap();
    assert!(cache.cached().is_some());

    cache.clear_cache();
    assert!(cache.cached().is_none());
    cache.get_valid_token().await.unwrap();
    assert_eq!(cache.fetch_count(), 2);
}

#[tokio::test]
async fn test_rejected_token_is_an_auth_error_and_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(2)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    let err = cache.get_valid_token().await.unwrap_err();
    assert_eq!(err, CredentialError::Status { status: 401, body: "invalid api key".into() });
    assert!(err.is_auth());
    assert!(cache.cached().is_none());

    // Failures are not sticky.
    assert!(cache.get_valid_token().await.is_err());
}

#[tokio::test]
async fn test_malformed_response_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = cache_for(&server).get_valid_token().await.unwrap_err();
    assert!(matches!(err, CredentialError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_unrepresentable_lifetime_fails_every_waiter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("forever", i64::MAX).set_delay(std::time::Duration::from_millis(50)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    let results = futures::future::join_all((0..4).map(|_| cache.get_valid_token())).await;
    for result in results {
        assert!(matches!(result, Err(CredentialError::InvalidResponse(_))));
    }
    assert!(cache.cached().is_none());
}

/// Source that blocks every fetch until released.
struct GatedSource {
    gate: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialSource for GatedSource {
    async fn fetch(&self, model: &str) -> Result<Credential, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.notified().await;
        Ok(Credential {
            token: format!("t{n}"),
            expires_at: Utc::now() + Duration::hours(1),
            model_id: model.to_string(),
            project_id: None,
            model: model.to_string(),
        })
    }
}

#[tokio::test]
async fn test_clear_during_refresh_does_not_resurrect_old_token() {
    let source = Arc::new(GatedSource { gate: Notify::new(), calls: AtomicUsize::new(0) });
    let cache = Arc::new(CredentialCache::new(source.clone(), "m1"));

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_valid_token().await }
    });
    while source.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    cache.clear_cache();
    source.gate.notify_one();

    // The waiter still gets its answer, but the cache stays empty.
    assert_eq!(waiter.await.unwrap().unwrap().token, "t1");
    assert!(cache.cached().is_none());
}
