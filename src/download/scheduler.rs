//! Download scheduler: bounded concurrency, retries, cancellation.
//!
//! The scheduler takes the filtered tasks in traversal order and runs each
//! one in its own Tokio task once a semaphore permit is available. Every task
//! reports exactly one [`TaskOutcome`] on the outcome channel, whatever
//! happens to it: success, skip, terminal failure, cancellation, or a panic
//! in the worker.
//!
//! # Concurrency Model
//!
//! - A semaphore bounds outstanding downloads (and so HTTP connections)
//! - Each download runs in a task of a `JoinSet`; permits are released on drop
//! - The shared [`RateBudget`](crate::api::RateBudget) inside the client can
//!   pause every worker at once after a 429 or an exhausted window
//!
//! # Retry Behavior
//!
//! - Transient and rate-limited failures are retried under the [`RetryPolicy`]
//! - A 429's Retry-After replaces the computed backoff
//! - Auth, fatal and local IO failures end the task immediately
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use canvas_dl::{AccessToken, ApiClient, CollisionPolicy, DownloadScheduler, LayoutWriter, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(tasks: Vec<canvas_dl::DownloadTask>) -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiClient::new("https://canvas.uva.nl/api/v1", AccessToken::new("token"))?;
//! let layout = Arc::new(LayoutWriter::new("./downloads", CollisionPolicy::Suffix));
//! let scheduler = DownloadScheduler::new(4, RetryPolicy::default(), client, layout)?;
//! let outcomes = scheduler.run_to_completion(tasks, &CancellationToken::new()).await;
//! println!("{} outcomes", outcomes.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::task::{DownloadTask, TaskOutcome, TaskStatus};
use crate::api::{ApiClient, FetchError, RetryDecision, RetryPolicy, classify_error};
use crate::layout::{LayoutWriter, Reservation};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 64;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 4;

const CANCELLED: &str = "cancelled";

/// Error type for scheduler construction.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Live counters for a scheduler run.
///
/// Shared behind an `Arc` so a progress display can poll it while downloads
/// are running.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Files downloaded.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Files already present.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Files that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts made.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Tasks that reached a terminal state.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.skipped() + self.failed()
    }

    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome.status {
            TaskStatus::Succeeded => &self.completed,
            TaskStatus::Skipped => &self.skipped,
            TaskStatus::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a worker needs, shared by all spawned tasks.
#[derive(Debug)]
struct Worker {
    client: ApiClient,
    layout: Arc<LayoutWriter>,
    policy: RetryPolicy,
    stats: Arc<DownloadStats>,
}

/// Bounded-concurrency download scheduler.
#[derive(Debug)]
pub struct DownloadScheduler {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    worker: Arc<Worker>,
}

impl DownloadScheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConcurrency`] if `concurrency` is
    /// outside 1..=64.
    #[instrument(level = "debug", skip(retry_policy, client, layout))]
    pub fn new(
        concurrency: usize,
        retry_policy: RetryPolicy,
        client: ApiClient,
        layout: Arc<LayoutWriter>,
    ) -> Result<Self, SchedulerError> {
        validate_concurrency(concurrency)?;
        debug!(
            concurrency,
            max_attempts = retry_policy.max_attempts(),
            "creating download scheduler"
        );
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            worker: Arc::new(Worker {
                client,
                layout,
                policy: retry_policy,
                stats: Arc::new(DownloadStats::new()),
            }),
        })
    }

    /// Uses `stats` for live counters (e.g. one shared with a progress display).
    #[must_use]
    pub fn with_stats(self, stats: Arc<DownloadStats>) -> Self {
        let Self {
            semaphore,
            concurrency,
            worker,
        } = self;
        let worker = match Arc::try_unwrap(worker) {
            Ok(worker) => Worker { stats, ..worker },
            Err(shared) => Worker {
                client: shared.client.clone(),
                layout: Arc::clone(&shared.layout),
                policy: shared.policy.clone(),
                stats,
            },
        };
        Self {
            semaphore,
            concurrency,
            worker: Arc::new(worker),
        }
    }

    /// The configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The live counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<DownloadStats> {
        &self.worker.stats
    }

    /// Runs every task to a terminal state, sending each outcome as it happens.
    ///
    /// Returns once every task has reported. After `cancel` fires no new task
    /// starts; unstarted tasks and interrupted downloads report
    /// `Failed("cancelled")`.
    #[instrument(skip_all, fields(tasks = tasks.len(), concurrency = self.concurrency))]
    pub async fn run(
        &self,
        tasks: Vec<DownloadTask>,
        cancel: &CancellationToken,
        outcomes: mpsc::UnboundedSender<TaskOutcome>,
    ) {
        let mut set = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, TaskOutcome> = HashMap::new();
        let mut pending = tasks.into_iter();

        info!("starting downloads");

        while let Some(task) = pending.next() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!("intake stopped, reporting remaining tasks as cancelled");
                for task in std::iter::once(task).chain(pending.by_ref()) {
                    let outcome = task.fail(CANCELLED);
                    self.worker.stats.record(&outcome);
                    let _ = outcomes.send(outcome);
                }
                break;
            };

            let panic_outcome = task.failure_outcome("download task panicked");
            let worker = Arc::clone(&self.worker);
            let cancel = cancel.clone();
            let outcomes = outcomes.clone();
            let handle = set.spawn(async move {
                let _permit = permit;
                let outcome = worker.process(task, &cancel).await;
                worker.stats.record(&outcome);
                let _ = outcomes.send(outcome);
            });
            in_flight.insert(handle.id(), panic_outcome);
        }

        debug!(in_flight = set.len(), "waiting for downloads to complete");

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    in_flight.remove(&id);
                }
                Err(error) => {
                    warn!(error = %error, "download task panicked");
                    if let Some(outcome) = in_flight.remove(&error.id()) {
                        self.worker.stats.record(&outcome);
                        let _ = outcomes.send(outcome);
                    }
                }
            }
        }

        let stats = &self.worker.stats;
        info!(
            completed = stats.completed(),
            skipped = stats.skipped(),
            failed = stats.failed(),
            retried = stats.retried(),
            "downloads finished"
        );
    }

    /// Runs every task and returns the outcomes (in completion order).
    pub async fn run_to_completion(
        &self,
        tasks: Vec<DownloadTask>,
        cancel: &CancellationToken,
    ) -> Vec<TaskOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.run(tasks, cancel, tx).await;
        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Worker {
    /// Drives one task through reserve, download attempts and commit.
    #[instrument(skip_all, fields(file_id = task.file().id, dest = %task.dest().display()))]
    async fn process(&self, mut task: DownloadTask, cancel: &CancellationToken) -> TaskOutcome {
        let Some(url) = task.file().download_url.clone() else {
            warn!("file has no download URL (locked or unpublished)");
            return task.fail("no download URL (file is locked or unavailable)");
        };

        let folder = task.folder().to_path_buf();
        if let Err(e) = self.layout.ensure_dir(&folder).await {
            return task.fail(e);
        }

        let size = task.file().size;
        let reservation = match task.known_copy() {
            Some(known) => self.layout.reserve_known(known, size).await,
            None => self.layout.reserve(task.dest(), size).await,
        };
        let final_path = match reservation {
            Ok(Reservation::Existing(path)) => {
                debug!(path = %path.display(), "already present, skipping");
                return task.skip(path);
            }
            Ok(Reservation::Fresh(path)) => path,
            Err(e) => return task.fail(e),
        };

        loop {
            if cancel.is_cancelled() {
                return task.fail(CANCELLED);
            }
            let attempt = task.begin_attempt();
            let staging = self.layout.staging_path(&final_path);
            debug!(attempt, "attempting download");

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(FetchError::Cancelled),
                result = self.client.download(&url, &staging) => result,
            };

            let error = match result {
                Ok(bytes) => {
                    return match self.layout.commit(&staging, &final_path).await {
                        Ok(()) => {
                            info!(path = %final_path.display(), bytes, attempt, "download complete");
                            task.succeed(final_path)
                        }
                        Err(e) => task.fail(e),
                    };
                }
                Err(error) => error,
            };

            self.layout.discard(&staging).await;
            if matches!(error, FetchError::Cancelled) {
                return task.fail(CANCELLED);
            }

            match self.policy.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry {
                    delay: backoff,
                    attempt: next_attempt,
                } => {
                    let retry_after = match &error {
                        FetchError::RateLimited { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let delay = retry_after.unwrap_or(backoff);
                    info!(
                        attempt = next_attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after.is_some(),
                        error = %error,
                        "retrying download"
                    );
                    self.stats.increment_retried();
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return task.fail(CANCELLED),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %error, attempt, %reason, "download failed");
                    return task.fail(error);
                }
            }
        }
    }
}

/// Checks a concurrency value against the allowed range.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidConcurrency`] when out of range.
pub fn validate_concurrency(value: usize) -> Result<(), SchedulerError> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidConcurrency { value })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::*;
    use crate::api::RateBudget;
    use crate::auth::AccessToken;
    use crate::layout::CollisionPolicy;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use crate::tree::{FileNode, FolderKey};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::ZERO,
        )
    }

    fn client(base: &str) -> ApiClient {
        ApiClient::with_options(
            base,
            AccessToken::new("7~scheduler-test-token"),
            Arc::new(RateBudget::disabled()),
            5,
            5,
        )
        .unwrap()
    }

    fn task(id: u64, url: Option<String>, dir: &Path, name: &str, size: Option<u64>) -> DownloadTask {
        let file = FileNode {
            id,
            name: name.to_string(),
            folder: FolderKey::Root,
            size,
            content_type: None,
            download_url: url,
            updated_at: None,
            path: PathBuf::from(name),
        };
        DownloadTask::new(file, dir.join(name))
    }

    fn scheduler(base: &str, root: &Path, concurrency: usize) -> DownloadScheduler {
        let layout = Arc::new(LayoutWriter::new(root, CollisionPolicy::Suffix));
        DownloadScheduler::new(concurrency, fast_policy(), client(base), layout).unwrap()
    }

    #[test]
    fn test_concurrency_bounds() {
        assert!(validate_concurrency(1).is_ok());
        assert!(validate_concurrency(DEFAULT_CONCURRENCY).is_ok());
        assert!(validate_concurrency(64).is_ok());
        assert!(matches!(
            validate_concurrency(0),
            Err(SchedulerError::InvalidConcurrency { value: 0 })
        ));
        assert!(matches!(
            validate_concurrency(65),
            Err(SchedulerError::InvalidConcurrency { value: 65 })
        ));
    }

    #[test]
    fn test_scheduler_error_display() {
        let msg = SchedulerError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn test_default_concurrency_constant() {
        assert_eq!(DEFAULT_CONCURRENCY, 4);
    }

    #[tokio::test]
    async fn test_downloads_every_task() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        for n in 0..5 {
            Mock::given(method("GET"))
                .and(path(format!("/files/{n}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(format!("body-{n}")))
                .expect(1)
                .mount(&server)
                .await;
        }

        let tasks = (0..5)
            .map(|n| {
                let url = format!("{}/files/{n}", server.uri());
                task(n, Some(url), dir.path(), &format!("f{n}.pdf"), None)
            })
            .collect();
        let scheduler = scheduler(&server.uri(), dir.path(), 2);
        let outcomes = scheduler
            .run_to_completion(tasks, &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.status == TaskStatus::Succeeded));
        for n in 0..5 {
            let body = std::fs::read_to_string(dir.path().join(format!("f{n}.pdf"))).unwrap();
            assert_eq!(body, format!("body-{n}"));
        }
        assert_eq!(scheduler.stats().completed(), 5);
    }

    #[tokio::test]
    async fn test_failure_isolated_from_siblings() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fine"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let tasks = vec![
            task(1, Some(format!("{}/gone", server.uri())), dir.path(), "gone.pdf", None),
            task(2, Some(format!("{}/ok", server.uri())), dir.path(), "ok.pdf", None),
            task(3, None, dir.path(), "locked.pdf", None),
        ];
        let scheduler = scheduler(&server.uri(), dir.path(), 4);
        let mut outcomes = scheduler
            .run_to_completion(tasks, &CancellationToken::new())
            .await;
        outcomes.sort_by_key(|o| o.file_id);

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, TaskStatus::Failed);
        assert!(outcomes[0].error.as_deref().unwrap().contains("404"));
        assert_eq!(outcomes[0].attempts, 1);
        assert_eq!(outcomes[1].status, TaskStatus::Succeeded);
        assert_eq!(outcomes[2].status, TaskStatus::Failed);
        assert_eq!(outcomes[2].attempts, 0);
        assert!(!dir.path().join("gone.pdf").exists());
        assert!(dir.path().join("ok.pdf").exists());
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"third time"))
            .mount(&server)
            .await;

        let tasks = vec![task(1, Some(format!("{}/flaky", server.uri())), dir.path(), "f.pdf", None)];
        let scheduler = scheduler(&server.uri(), dir.path(), 1);
        let outcomes = scheduler
            .run_to_completion(tasks, &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].status, TaskStatus::Succeeded);
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(scheduler.stats().retried(), 2);
        assert_eq!(std::fs::read(dir.path().join("f.pdf")).unwrap(), b"third time");
    }

    #[tokio::test]
    async fn test_retry_ceiling_then_failure() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let tasks = vec![task(1, Some(format!("{}/down", server.uri())), dir.path(), "d.pdf", None)];
        let outcomes = scheduler(&server.uri(), dir.path(), 1)
            .run_to_completion(tasks, &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].status, TaskStatus::Failed);
        assert_eq!(outcomes[0].attempts, 3);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "no staging or final file may remain");
    }

    #[tokio::test]
    async fn test_identical_existing_file_skipped_without_request() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("have.pdf"), b"12345").unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let tasks = vec![task(
            1,
            Some(format!("{}/have", server.uri())),
            dir.path(),
            "have.pdf",
            Some(5),
        )];
        let scheduler = scheduler(&server.uri(), dir.path(), 1);
        let outcomes = scheduler
            .run_to_completion(tasks, &CancellationToken::new())
            .await;
        assert_eq!(outcomes[0].status, TaskStatus::Skipped);
        assert_eq!(scheduler.stats().skipped(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_every_task() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let tasks = (0..4)
            .map(|n| task(n, Some(format!("http://127.0.0.1:9/{n}")), dir.path(), "x.pdf", None))
            .collect();
        let scheduler = scheduler("http://127.0.0.1:9", dir.path(), 2);
        let outcomes = scheduler.run_to_completion(tasks, &cancel).await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.status == TaskStatus::Failed));
        assert!(outcomes.iter().all(|o| o.error.as_deref() == Some("cancelled")));
        assert_eq!(scheduler.stats().failed(), 4);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_download() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let tasks = vec![task(1, Some(format!("{}/slow", server.uri())), dir.path(), "s.pdf", None)];
        let outcomes = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler(&server.uri(), dir.path(), 1).run_to_completion(tasks, &cancel),
        )
        .await
        .unwrap();

        assert_eq!(outcomes[0].status, TaskStatus::Failed);
        assert_eq!(outcomes[0].error.as_deref(), Some("cancelled"));
        assert!(!dir.path().join("s.pdf").exists());
    }

    #[tokio::test]
    async fn test_shared_stats_handle() {
        let dir = TempDir::new().unwrap();
        let stats = Arc::new(DownloadStats::new());
        let scheduler = scheduler("http://127.0.0.1:9", dir.path(), 1).with_stats(Arc::clone(&stats));
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler
            .run_to_completion(vec![task(1, None, dir.path(), "a.pdf", None)], &cancel)
            .await;
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.total(), 1);
    }
}
