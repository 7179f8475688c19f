//! Unreachable hosts, slow servers and interruption.

use std::sync::Arc;
use std::time::Duration;

use canvas_dl::{
    AccessToken, ApiClient, CourseRequest, DownloadStats, RateBudget, RetryPolicy, download_course,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::support::socket_guard::start_mock_server_or_skip;

fn client(server: &MockServer) -> ApiClient {
    ApiClient::with_options(
        &format!("{}/api/v1", server.uri()),
        AccessToken::new("network-token"),
        Arc::new(RateBudget::new()),
        2,
        2,
    )
    .expect("client")
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10), Duration::ZERO)
}

async fn mount_listing(server: &MockServer, files: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/v1/courses/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5, "name": "Net"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses/5/folders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "course files", "parent_folder_id": null}
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses/5/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(files))
        .mount(server)
        .await;
}

#[tokio::test]
async fn p0_unreachable_file_host_fails_only_that_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_listing(
        &server,
        json!([
            {"id": 1, "display_name": "a.txt", "folder_id": 1, "size": 1,
             "url": format!("{}/files/1/download", server.uri())},
            {"id": 2, "display_name": "b.txt", "folder_id": 1, "size": 1,
             "url": "http://127.0.0.1:9/files/2/download"}
        ]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/files/1/download"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a".to_vec()))
        .mount(&server)
        .await;

    let dest = tempfile::TempDir::new().expect("temp");
    let stats = Arc::new(DownloadStats::new());
    let report = download_course(
        &client(&server),
        CourseRequest::new(5, dest.path())
            .with_retry_policy(fast_policy())
            .with_stats(Arc::clone(&stats)),
        &CancellationToken::new(),
    )
    .await
    .expect("course completes");

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].path.ends_with("b.txt"));
    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.failed(), 1);
    assert_eq!(stats.retried(), 1, "connection errors are retried once under the policy");
}

#[tokio::test]
async fn p0_cancel_before_start_reports_cancelled_without_downloads() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_listing(&server, json!([])).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let dest = tempfile::TempDir::new().expect("temp");
    let report = download_course(
        &client(&server),
        CourseRequest::new(5, dest.path()).with_retry_policy(fast_policy()),
        &cancel,
    )
    .await
    .expect("cancellation is not an error");

    assert!(report.cancelled);
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn p0_cancel_during_slow_download_stops_promptly() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_listing(
        &server,
        json!([
            {"id": 7, "display_name": "big.bin", "folder_id": 1, "size": 3,
             "url": format!("{}/files/7/download", server.uri())}
        ]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/files/7/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"big".to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let dest = tempfile::TempDir::new().expect("temp");
    let started = std::time::Instant::now();
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        download_course(
            &client(&server),
            CourseRequest::new(5, dest.path()).with_retry_policy(fast_policy()),
            &cancel,
        ),
    )
    .await
    .expect("cancellation must not wait for the slow server")
    .expect("course result");

    assert!(report.cancelled);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].error.contains("cancelled"));
    assert!(!dest.path().join("Net").join("big.bin").exists());
    assert!(started.elapsed() < Duration::from_secs(10));
}
