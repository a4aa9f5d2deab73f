//! Integration tests for [`HttpOrigin`] against a wiremock registry, and the
//! service running on top of it.

use std::time::{Duration, SystemTime};

use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use regcache::{
    AMBIENT_CREDENTIAL, Body, CacheConfig, CacheEntry, CacheError, CacheKey, CacheService,
    FetchRequest, HttpOrigin, Origin, QueueConfig,
};

fn request(server: &MockServer, route: &str) -> FetchRequest {
    FetchRequest::new(format!("{}{route}", server.uri()), Duration::from_secs(5))
}

// =============================================================================
// HttpOrigin
// =============================================================================

#[tokio::test]
async fn returns_body_status_and_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/index.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"abc\"")
                .set_body_string(r#"{"version":"3.0.0"}"#),
        )
        .mount(&server)
        .await;

    let origin = HttpOrigin::new().unwrap();
    let response = origin.fetch(&request(&server, "/v3/index.json")).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, r#"{"version":"3.0.0"}"#);
    assert_eq!(response.etag.as_deref(), Some("\"abc\""));
}

#[tokio::test]
async fn sends_if_none_match_and_passes_304_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg"))
        .and(header("If-None-Match", "\"abc\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let origin = HttpOrigin::new().unwrap();
    let req = request(&server, "/pkg").etag(Some("\"abc\"".into()));
    let response = origin.fetch(&req).await.unwrap();

    assert!(response.is_not_modified());
}

#[tokio::test]
async fn sends_bearer_token_for_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header("Authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let origin = HttpOrigin::new().unwrap();
    let req = request(&server, "/private").credential(Some("s3cret".into()));
    assert_eq!(origin.fetch(&req).await.unwrap().status_code, 200);
}

#[tokio::test]
async fn ambient_credential_sends_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header_exists("Authorization"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_string("anonymous"))
        .mount(&server)
        .await;

    let origin = HttpOrigin::new().unwrap();
    let req = request(&server, "/feed").credential(Some(AMBIENT_CREDENTIAL.into()));
    let response = origin.fetch(&req).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "anonymous");
}

#[tokio::test]
async fn error_statuses_are_responses_not_errors() {
    let server = MockServer::start().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;
    Mock::given(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let origin = HttpOrigin::new().unwrap();
    let missing = origin.fetch(&request(&server, "/missing")).await.unwrap();
    let broken = origin.fetch(&request(&server, "/broken")).await.unwrap();

    assert_eq!(missing.status_code, 404);
    assert_eq!(missing.body, "not found");
    assert!(broken.is_server_error());
}

#[tokio::test]
async fn slow_response_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let origin = HttpOrigin::new().unwrap();
    let req = FetchRequest::new(format!("{}/slow", server.uri()), Duration::from_millis(100));
    let err = origin.fetch(&req).await.unwrap_err();

    assert!(matches!(err, CacheError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn unreachable_host_is_a_transient_http_error() {
    let origin = HttpOrigin::new().unwrap();
    let req = FetchRequest::new("http://127.0.0.1:1/feed", Duration::from_secs(2));
    let err = origin.fetch(&req).await.unwrap_err();

    assert!(err.is_transient(), "got {err:?}");
}

// =============================================================================
// Service over HTTP
// =============================================================================

#[tokio::test]
async fn service_revalidates_stale_entry_with_stored_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("{}/pkg", server.uri());
    let cache = CacheService::builder()
        .http_origin()
        .unwrap()
        .config(CacheConfig::new().queue(
            QueueConfig::new().admission_delay(Duration::from_millis(20)),
        ))
        .storage_dir(dir.path())
        .build()
        .unwrap();

    let key = CacheKey::new(&url, None);
    let stale = CacheEntry {
        payload: Body::ok("payload"),
        timestamp: SystemTime::now() - Duration::from_secs(7200),
        etag: Some("\"v1\"".into()),
        origin_url: url.clone(),
    };
    cache.store().unwrap().put_entry(&key, &stale).await;

    assert_eq!(cache.request(&url, None).await.unwrap().body, "payload");

    let store = cache.store().unwrap();
    for _ in 0..250 {
        let entry = store.get(&key).await.unwrap();
        if entry.age(SystemTime::now()) < Duration::from_secs(60) {
            assert_eq!(entry.payload, Body::ok("payload"));
            assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stale entry was never revalidated");
}
