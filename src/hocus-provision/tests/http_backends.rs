//! HTTP store backend and address-resolution chain against a mock server.

use hocus_provision::{
    AddressResolver, AddressResolverConfig, HttpKeyMaterialStore, KeyMaterialStore, StoreError,
};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> HttpKeyMaterialStore {
    HttpKeyMaterialStore::new(
        format!("{}/vpn", server.uri()),
        Duration::from_secs(2),
        0,
    )
}

#[tokio::test]
async fn get_returns_object_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vpn/cacerts/ca-cert"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PEM".to_vec()))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert_eq!(store.get("cacerts/ca-cert").await.unwrap(), b"PEM");
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vpn/private/server-key"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.get("private/server-key").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(err.treat_as_absent());
}

#[tokio::test]
async fn forbidden_object_is_permission_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vpn/private/ca-key"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.get("private/ca-key").await.unwrap_err();
    assert!(matches!(err, StoreError::Permission(_)));
    assert!(!err.treat_as_absent());
}

#[tokio::test]
async fn backend_failure_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vpn/certs/server-cert"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.get("certs/server-cert").await.unwrap_err();
    assert!(matches!(err, StoreError::Transient(_)));
    assert!(err.treat_as_absent());
}

#[tokio::test]
async fn put_uploads_object() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/vpn/certs/client-iphone-cert"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    store
        .put("certs/client-iphone-cert", b"PEM")
        .await
        .unwrap();
}

#[tokio::test]
async fn transient_get_is_retried() {
    let server = MockServer::start().await;
    // first attempt fails, the retry succeeds
    Mock::given(method("GET"))
        .and(path("/vpn/cacerts/ca-cert"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vpn/cacerts/ca-cert"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PEM".to_vec()))
        .mount(&server)
        .await;

    let store = HttpKeyMaterialStore::new(
        format!("{}/vpn", server.uri()),
        Duration::from_secs(2),
        2,
    );
    assert_eq!(store.get("cacerts/ca-cert").await.unwrap(), b"PEM");
}

#[tokio::test]
async fn metadata_endpoint_wins_over_echo() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.9\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("198.51.100.1"))
        .mount(&server)
        .await;

    let resolver = AddressResolver::new(AddressResolverConfig {
        override_addr: None,
        metadata_url: format!("{}/metadata", server.uri()),
        echo_url: format!("{}/echo", server.uri()),
        timeout: Duration::from_secs(2),
        max_retries: 0,
    });
    let addr = resolver.resolve().await.unwrap();
    assert_eq!(addr.to_string(), "203.0.113.9");
}

#[tokio::test]
async fn echo_is_used_when_metadata_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("198.51.100.1"))
        .mount(&server)
        .await;

    let resolver = AddressResolver::new(AddressResolverConfig {
        override_addr: None,
        metadata_url: format!("{}/metadata", server.uri()),
        echo_url: format!("{}/echo", server.uri()),
        timeout: Duration::from_secs(2),
        max_retries: 0,
    });
    let addr = resolver.resolve().await.unwrap();
    assert_eq!(addr.to_string(), "198.51.100.1");
}

#[tokio::test]
async fn garbage_echo_body_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not an ip</html>"))
        .mount(&server)
        .await;

    let resolver = AddressResolver::new(AddressResolverConfig {
        override_addr: None,
        metadata_url: format!("{}/metadata", server.uri()),
        echo_url: format!("{}/echo", server.uri()),
        timeout: Duration::from_secs(2),
        max_retries: 0,
    });
    let err = resolver.resolve().await.unwrap_err();
    assert!(err.echo.contains("not an address"));
}
