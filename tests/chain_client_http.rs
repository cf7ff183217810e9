// Exercises `HttpChainClient` against a mock HTTP server (spec §13's
// wiremock-based transport testing), covering the 429/5xx → error-variant
// mapping `check_status` performs.

use observatory::chain_client::{ChainClient, HttpChainClient};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn latest_height_parses_a_successful_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/height"))
        .respond_with(ResponseTemplate::new(200).set_body_json(42))
        .mount(&server)
        .await;

    let base_url = url::Url::parse(&format!("{}/", server.uri())).unwrap();
    let client = HttpChainClient::new(base_url);

    let height = client.latest_height().await.unwrap();
    assert_eq!(height, 42);
}

#[tokio::test]
async fn rate_limited_response_maps_to_rate_limited_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/height"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let base_url = url::Url::parse(&format!("{}/", server.uri())).unwrap();
    let client = HttpChainClient::new(base_url);

    let err = client.latest_height().await.unwrap_err();
    assert!(matches!(
        err,
        observatory::error::ObservatoryError::RateLimited { .. }
    ));
}

#[tokio::test]
async fn server_error_maps_to_retryable_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blocks"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let base_url = url::Url::parse(&format!("{}/", server.uri())).unwrap();
    let client = HttpChainClient::new(base_url);

    let err = client.block_range(0, 9).await.unwrap_err();
    assert!(err.is_retryable());
}
