//! Integration tests for paginated listings against a mock Canvas API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use canvas_dl::{AccessToken, ApiClient, FetchError, RateBudget, RetryPolicy, list_courses};
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

fn client(server: &MockServer) -> ApiClient {
    ApiClient::with_options(
        &format!("{}/api/v1", server.uri()),
        AccessToken::new("pagination-token"),
        Arc::new(RateBudget::new()),
        5,
        5,
    )
    .unwrap()
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(5),
        Duration::from_millis(10),
        Duration::ZERO,
    )
}

fn next_link(server: &MockServer, page: u32) -> String {
    format!(
        "<{}/api/v1/courses?page={page}&per_page=100>; rel=\"next\", <{}/api/v1/courses?page=1&per_page=100>; rel=\"first\"",
        server.uri(),
        server.uri()
    )
}

#[tokio::test]
async fn test_list_courses_follows_next_links_in_order() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .and(query_param_is_missing("page"))
        .and(query_param("per_page", "100"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", next_link(&server, 2).as_str())
                .set_body_json(json!([
                    {"id": 1, "name": "Alpha", "course_code": "A1"},
                    {"id": 2, "name": "Beta"}
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .and(query_param("page", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", next_link(&server, 3).as_str())
                .set_body_json(json!([{"id": 3, "name": "Gamma"}])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 4}])))
        .expect(1)
        .mount(&server)
        .await;

    let courses = list_courses(&client(&server), &fast_policy(3)).await.unwrap();

    let ids: Vec<u64> = courses.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(courses[0].course_code.as_deref(), Some("A1"));
    assert!(courses[3].name.is_none(), "restricted course has no name");
}

#[tokio::test]
async fn test_page_fetcher_retries_server_error_then_succeeds() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 9}])))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("courses", &[("per_page", "100")]).unwrap();
    let mut pages = client.pages(url);
    let entries = pages.collect_all(&fast_policy(3)).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(pages.pages_fetched(), 1);
    assert!(pages.is_exhausted());
}

#[tokio::test]
async fn test_page_fetcher_gives_up_after_max_attempts() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("courses", &[]).unwrap();
    let err = client.pages(url).collect_all(&fast_policy(2)).await.unwrap_err();

    assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
}

#[tokio::test]
async fn test_page_fetcher_does_not_retry_auth_failure() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("courses", &[]).unwrap();
    let err = client.pages(url).collect_all(&fast_policy(5)).await.unwrap_err();

    assert!(err.is_auth());
}

#[tokio::test]
async fn test_rate_limited_page_waits_for_retry_after() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 5}])))
        .mount(&server)
        .await;

    let client = client(&server);
    let url = client.endpoint("courses", &[]).unwrap();
    let start = Instant::now();
    let entries = client.pages(url).collect_all(&fast_policy(3)).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert!(
        start.elapsed() >= Duration::from_secs(1),
        "retry must honor Retry-After, waited {:?}",
        start.elapsed()
    );
}
