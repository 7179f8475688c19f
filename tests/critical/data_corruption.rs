//! Interrupted or failed transfers must never leave a file at its final path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use canvas_dl::{
    AccessToken, ApiClient, CollisionPolicy, CourseRequest, RateBudget, RetryPolicy,
    download_course,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::support::socket_guard::start_mock_server_or_skip;

fn client(server: &MockServer) -> ApiClient {
    ApiClient::with_options(
        &format!("{}/api/v1", server.uri()),
        AccessToken::new("data-token"),
        Arc::new(RateBudget::new()),
        5,
        5,
    )
    .expect("client")
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10), Duration::ZERO)
}

async fn mount_single_file(server: &MockServer, size: u64) {
    Mock::given(method("GET"))
        .and(path("/api/v1/courses/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 3, "name": "Data"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses/3/folders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "course files", "parent_folder_id": null}
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/courses/3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": 50,
            "display_name": "report.pdf",
            "folder_id": 1,
            "size": size,
            "url": format!("{}/files/50/download", server.uri()),
        }])))
        .mount(server)
        .await;
}

fn part_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".part"))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn p0_failed_download_leaves_no_partial_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_single_file(&server, 4).await;
    Mock::given(method("GET"))
        .and(path("/files/50/download"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let dest = tempfile::TempDir::new().expect("temp");
    let report = download_course(
        &client(&server),
        CourseRequest::new(3, dest.path()).with_retry_policy(fast_policy()),
        &CancellationToken::new(),
    )
    .await
    .expect("per-file failures do not abort the course");

    let course_dir = dest.path().join("Data");
    assert_eq!(report.failed.len(), 1);
    assert!(!course_dir.join("report.pdf").exists());
    assert!(part_files(&course_dir).is_empty(), "staging files must be cleaned up");
}

#[tokio::test]
async fn p0_different_existing_file_is_not_overwritten_by_default() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_single_file(&server, 4).await;
    Mock::given(method("GET"))
        .and(path("/files/50/download"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dest = tempfile::TempDir::new().expect("temp");
    let course_dir = dest.path().join("Data");
    std::fs::create_dir_all(&course_dir).expect("mkdir");
    std::fs::write(course_dir.join("report.pdf"), b"local edits").expect("write");

    let report = download_course(
        &client(&server),
        CourseRequest::new(3, dest.path())
            .with_retry_policy(fast_policy())
            .with_collision(CollisionPolicy::Suffix),
        &CancellationToken::new(),
    )
    .await
    .expect("download");

    assert_eq!(
        std::fs::read(course_dir.join("report.pdf")).expect("original"),
        b"local edits"
    );
    assert_eq!(report.succeeded, vec![course_dir.join("report_1.pdf")]);
    assert_eq!(std::fs::read(course_dir.join("report_1.pdf")).expect("new"), b"%PDF");
}

#[tokio::test]
async fn p0_overwrite_policy_replaces_different_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_single_file(&server, 4).await;
    Mock::given(method("GET"))
        .and(path("/files/50/download"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
        .mount(&server)
        .await;

    let dest = tempfile::TempDir::new().expect("temp");
    let course_dir = dest.path().join("Data");
    std::fs::create_dir_all(&course_dir).expect("mkdir");
    std::fs::write(course_dir.join("report.pdf"), b"stale copy").expect("write");

    download_course(
        &client(&server),
        CourseRequest::new(3, dest.path())
            .with_retry_policy(fast_policy())
            .with_collision(CollisionPolicy::Overwrite),
        &CancellationToken::new(),
    )
    .await
    .expect("download");

    assert_eq!(std::fs::read(course_dir.join("report.pdf")).expect("file"), b"%PDF");
}
