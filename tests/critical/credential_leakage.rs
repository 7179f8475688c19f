//! Assert the access token never appears in errors, Debug output, or URLs.

use std::sync::Arc;

use canvas_dl::{
    AccessToken, ApiClient, CourseRequest, RateBudget, RetryPolicy, download_course, list_courses,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::support::socket_guard::start_mock_server_or_skip;

const SECRET: &str = "1~very-secret-canvas-token-abcdef";

fn client(base: &str) -> ApiClient {
    ApiClient::with_options(
        base,
        AccessToken::new(SECRET),
        Arc::new(RateBudget::new()),
        2,
        2,
    )
    .expect("client")
}

#[test]
fn p0_token_debug_and_display_are_masked() {
    let token = AccessToken::new(SECRET);
    assert!(!format!("{token:?}").contains(SECRET));
    assert!(!format!("{token}").contains(SECRET));
    assert!(!format!("{:?}", client("https://canvas.example.edu/api/v1")).contains(SECRET));
}

#[tokio::test]
async fn p0_auth_error_does_not_contain_token() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(401).set_body_string(SECRET))
        .mount(&server)
        .await;

    let err = list_courses(
        &client(&format!("{}/api/v1", server.uri())),
        &RetryPolicy::with_max_attempts(1),
    )
    .await
    .expect_err("401 must fail");

    let msg = format!("{err} {err:?}");
    assert!(!msg.contains(SECRET), "FetchError must not contain token: {msg}");
    assert!(err.is_auth());
}

#[tokio::test]
async fn p0_token_sent_as_bearer_header_only() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .and(header("authorization", format!("Bearer {SECRET}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(1)
        .mount(&server)
        .await;

    list_courses(
        &client(&format!("{}/api/v1", server.uri())),
        &RetryPolicy::with_max_attempts(1),
    )
    .await
    .expect("listing succeeds");

    let requests = server.received_requests().await.expect("recording enabled");
    assert!(
        requests.iter().all(|r| !r.url.as_str().contains(SECRET)),
        "token must never be part of a URL"
    );
}

#[tokio::test]
async fn p0_network_error_does_not_contain_token() {
    // Port 9 (discard) on localhost is not expected to accept connections.
    let err = download_course(
        &client("http://127.0.0.1:9/api/v1"),
        CourseRequest::new(1, tempfile::TempDir::new().expect("temp").path())
            .with_retry_policy(RetryPolicy::with_max_attempts(1)),
        &CancellationToken::new(),
    )
    .await
    .expect_err("nothing listens on the discard port");

    let msg = format!("{err} {err:?}");
    assert!(!msg.contains(SECRET), "CourseError must not contain token: {msg}");
}
