//! The course pipeline: list, build tree, filter, download, merge.
//!
//! [`download_course`] is the library entry point. It propagates only errors
//! that make the whole run meaningless: rejected credentials during listing,
//! listing failures that outlive the retry policy, broken folder structure,
//! and local setup problems. Everything that goes wrong with an individual
//! file ends up in the [`CourseReport`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiClient, Entry, FetchError, ModuleEntry, RetryPolicy};
use crate::download::{
    DEFAULT_CONCURRENCY, DownloadScheduler, DownloadStats, DownloadTask, SchedulerError,
    TaskOutcome, TaskStatus,
};
use crate::filter::FilterSpec;
use crate::layout::{CollisionPolicy, LayoutError, LayoutWriter, sanitize_component};
use crate::merge::{MergeCoordinator, MergePolicy, MergeScope, MergeSummary, PdfMerger, course_output};
use crate::state::SyncState;
use crate::tree::{TreeBuilder, TreeError, destination};

const PER_PAGE: (&str, &str) = ("per_page", crate::api::constants::PER_PAGE);

/// Errors that abort a course download.
#[derive(Debug, Error)]
pub enum CourseError {
    /// The API rejected the credentials while listing.
    #[error("authentication failed while listing course {course_id}: {source}")]
    Auth {
        course_id: u64,
        #[source]
        source: FetchError,
    },

    /// A listing request failed after retries.
    #[error("failed to list {what} for course {course_id}: {source}")]
    Listing {
        course_id: u64,
        what: &'static str,
        #[source]
        source: FetchError,
    },

    /// Folder structure could not be resolved.
    #[error("invalid folder structure for course {course_id}: {source}")]
    Tree {
        course_id: u64,
        #[source]
        source: TreeError,
    },

    /// Invalid scheduler settings.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The destination could not be prepared.
    #[error("cannot prepare destination: {source}")]
    Io {
        #[source]
        source: LayoutError,
    },
}

impl CourseError {
    fn listing(course_id: u64, what: &'static str, source: FetchError) -> Self {
        if source.is_auth() {
            Self::Auth { course_id, source }
        } else {
            Self::Listing {
                course_id,
                what,
                source,
            }
        }
    }

    /// Returns true for credential failures.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Where the course structure comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentSource {
    /// The course's Files area, folder by folder.
    #[default]
    Folders,
    /// The course's modules; each module becomes a folder.
    Modules,
}

impl std::str::FromStr for ContentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folders" | "files" => Ok(Self::Folders),
            "modules" => Ok(Self::Modules),
            other => Err(format!(
                "unknown content source '{other}' (expected folders or modules)"
            )),
        }
    }
}

/// Merge settings for a run.
#[derive(Clone)]
pub struct MergeOptions {
    /// Backend that concatenates the PDFs.
    pub merger: Arc<dyn PdfMerger>,
    /// Folder, course or both.
    pub scope: MergeScope,
    /// Whether originals survive a successful merge.
    pub policy: MergePolicy,
}

impl MergeOptions {
    #[must_use]
    pub fn new(merger: Arc<dyn PdfMerger>) -> Self {
        Self {
            merger,
            scope: MergeScope::default(),
            policy: MergePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: MergeScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for MergeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeOptions")
            .field("merger", &self.merger.name())
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Everything [`download_course`] needs besides the client.
#[derive(Debug, Clone)]
pub struct CourseRequest {
    /// Canvas course id.
    pub course_id: u64,
    /// Parent of the course directory.
    pub dest_root: PathBuf,
    /// Which files to download.
    pub filter: FilterSpec,
    /// Download workers, 1 to 64.
    pub concurrency: usize,
    /// Retry rules shared by listing and downloads.
    pub retry_policy: RetryPolicy,
    /// What to do when the target name is taken by a different file.
    pub collision: CollisionPolicy,
    /// Folder tree or module listing.
    pub source: ContentSource,
    /// `None` disables merging.
    pub merge: Option<MergeOptions>,
    /// Live counters, e.g. for a progress display.
    pub stats: Option<Arc<DownloadStats>>,
}

impl CourseRequest {
    /// A request with default settings: every file, 4 workers, no merge.
    #[must_use]
    pub fn new(course_id: u64, dest_root: impl Into<PathBuf>) -> Self {
        Self {
            course_id,
            dest_root: dest_root.into(),
            filter: FilterSpec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            collision: CollisionPolicy::default(),
            source: ContentSource::default(),
            merge: None,
            stats: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_collision(mut self, collision: CollisionPolicy) -> Self {
        self.collision = collision;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: ContentSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_merge(mut self, merge: MergeOptions) -> Self {
        self.merge = Some(merge);
        self
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<DownloadStats>) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// A file that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    /// Where the file would have been written.
    pub path: PathBuf,
    /// Last error, token-free.
    pub error: String,
}

/// Result of a course download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseReport {
    /// Display name as reported by Canvas.
    pub course_name: String,
    /// Directory the course was written to.
    pub course_dir: PathBuf,
    /// Files downloaded on this run, sorted.
    pub succeeded: Vec<PathBuf>,
    /// Files already present and left alone, sorted.
    pub skipped: Vec<PathBuf>,
    /// Files that could not be downloaded.
    pub failed: Vec<FailedFile>,
    /// Merged PDFs written.
    pub merged: Vec<PathBuf>,
    /// Merges that failed or left inputs out.
    pub merge_warnings: Vec<crate::merge::MergeWarning>,
    /// Entries the listing returned that could not be used.
    pub listing_warnings: Vec<String>,
    /// True when the run was interrupted.
    pub cancelled: bool,
}

impl CourseReport {
    /// Files that reached a terminal state.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }

    /// True when nothing failed and the run was not cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    fn absorb(&mut self, outcomes: Vec<TaskOutcome>) {
        for outcome in outcomes {
            match outcome.status {
                TaskStatus::Succeeded => self.succeeded.push(outcome.path),
                TaskStatus::Skipped => self.skipped.push(outcome.path),
                TaskStatus::Failed => self.failed.push(FailedFile {
                    path: outcome.path,
                    error: outcome.error.unwrap_or_else(|| "unknown error".to_string()),
                }),
            }
        }
        self.succeeded.sort();
        self.skipped.sort();
        self.failed.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

/// A course visible to the token's user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CourseSummary {
    /// Canvas course id.
    pub id: u64,
    /// Display name; missing for courses the user may no longer open.
    #[serde(default)]
    pub name: Option<String>,
    /// Short code such as `INFO-101`.
    #[serde(default)]
    pub course_code: Option<String>,
    /// `unpublished`, `available`, `completed` or `deleted`.
    #[serde(default)]
    pub workflow_state: Option<String>,
}

impl CourseSummary {
    /// Returns true for courses students can currently see.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.workflow_state.as_deref() == Some("available")
    }
}

#[derive(Debug, Deserialize)]
struct CourseInfo {
    #[serde(default)]
    name: Option<String>,
}

/// Downloads every file of a course that passes the request's filter.
///
/// # Errors
///
/// See [`CourseError`]. Per-file failures are reported in
/// [`CourseReport::failed`] instead.
#[instrument(skip_all, fields(course_id = request.course_id, source = ?request.source))]
pub async fn download_course(
    client: &ApiClient,
    request: CourseRequest,
    cancel: &CancellationToken,
) -> Result<CourseReport, CourseError> {
    let CourseRequest {
        course_id,
        dest_root,
        filter,
        concurrency,
        retry_policy,
        collision,
        source,
        merge,
        stats,
    } = request;

    // Validate before any request goes out.
    crate::download::validate_concurrency(concurrency)?;

    let listing = async {
        let name = fetch_course_name(client, course_id, &retry_policy).await?;
        let builder = match source {
            ContentSource::Folders => list_folders(client, course_id, &retry_policy).await?,
            ContentSource::Modules => {
                list_modules(client, course_id, &retry_policy, concurrency).await?
            }
        };
        Ok::<_, CourseError>((name, builder))
    };
    let listed = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        listed = listing => Some(listed?),
    };
    let Some((course_name, builder)) = listed else {
        info!("cancelled during listing");
        return Ok(CourseReport {
            cancelled: true,
            ..CourseReport::default()
        });
    };

    let listing_warnings = builder.warnings().to_vec();
    let tree = builder
        .build()
        .map_err(|source| CourseError::Tree { course_id, source })?;

    let dir_name = sanitize_component(&course_name);
    let course_dir = dest_root.join(&dir_name);

    let mut sync_state = SyncState::load(&course_dir).await;
    let tasks: Vec<DownloadTask> = tree
        .files_depth_first()
        .into_iter()
        .filter(|file| filter.matches(file))
        .map(|file| {
            let dest = destination(&course_dir, file);
            let known = sync_state.known_copy(&course_dir, file, &dest);
            DownloadTask::new(file.clone(), dest).with_known_copy(known)
        })
        .collect();
    let stamps: HashMap<u64, Option<String>> = tasks
        .iter()
        .map(|task| (task.file().id, task.file().updated_at.clone()))
        .collect();
    info!(
        course = %course_name,
        files = tree.file_count(),
        folders = tree.folder_count(),
        selected = tasks.len(),
        "course listed"
    );

    let layout = Arc::new(LayoutWriter::new(&course_dir, collision));
    layout
        .ensure_dir(&course_dir)
        .await
        .map_err(|source| CourseError::Io { source })?;

    let mut scheduler = DownloadScheduler::new(concurrency, retry_policy, client.clone(), layout)?;
    if let Some(stats) = stats {
        scheduler = scheduler.with_stats(stats);
    }

    let mut coordinator = merge.map(|options| {
        let mut coordinator =
            MergeCoordinator::new(options.merger, options.scope, options.policy, cancel.clone())
                .with_course_output(course_output(&course_dir, &dir_name));
        for task in &tasks {
            coordinator.plan_file(task.folder(), task.file().id);
        }
        coordinator
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = scheduler.run(tasks, cancel, tx);
    let collect = async {
        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            if let Some(coordinator) = coordinator.as_mut() {
                coordinator.record(&outcome);
            }
            outcomes.push(outcome);
        }
        outcomes
    };
    let ((), outcomes) = tokio::join!(run, collect);

    for outcome in outcomes.iter().filter(|o| o.is_present()) {
        let stamp = stamps.get(&outcome.file_id).cloned().flatten();
        sync_state.record(&course_dir, outcome.file_id, stamp, &outcome.path);
    }
    if let Err(e) = sync_state.save(&course_dir).await {
        warn!(error = %e, "could not save sync state; the next run re-checks files by size");
    }

    let MergeSummary { merged, warnings } = match coordinator {
        Some(coordinator) => coordinator.finish().await,
        None => MergeSummary::default(),
    };

    let mut report = CourseReport {
        course_name,
        course_dir,
        merged,
        merge_warnings: warnings,
        listing_warnings,
        cancelled: cancel.is_cancelled(),
        ..CourseReport::default()
    };
    report.absorb(outcomes);

    info!(
        succeeded = report.succeeded.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        merged = report.merged.len(),
        cancelled = report.cancelled,
        "course finished"
    );
    Ok(report)
}

/// Lists the courses the token's user is enrolled in.
///
/// # Errors
///
/// The first page error that survives `policy`.
#[instrument(skip_all)]
pub async fn list_courses(
    client: &ApiClient,
    policy: &RetryPolicy,
) -> Result<Vec<CourseSummary>, FetchError> {
    let url = client.endpoint("courses", &[PER_PAGE])?;
    let entries = client.pages(url).collect_all(policy).await?;
    let courses: Vec<CourseSummary> = entries
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect();
    debug!(courses = courses.len(), "listed courses");
    Ok(courses)
}

/// The course's display name, or `course-{id}` when it cannot be read.
async fn fetch_course_name(
    client: &ApiClient,
    course_id: u64,
    policy: &RetryPolicy,
) -> Result<String, CourseError> {
    let fallback = format!("course-{course_id}");
    let url = client
        .endpoint(&format!("courses/{course_id}"), &[])
        .map_err(|source| CourseError::listing(course_id, "course", source))?;

    let page = match client.pages(url).next_page_with_retry(policy).await {
        Ok(page) => page,
        Err(error) if error.is_auth() => return Err(CourseError::listing(course_id, "course", error)),
        Err(error) => {
            warn!(error = %error, fallback = %fallback, "could not read course name");
            return Ok(fallback);
        }
    };

    let name = page
        .and_then(|page| page.entries.into_iter().next())
        .and_then(|value| serde_json::from_value::<CourseInfo>(value).ok())
        .and_then(|info| info.name)
        .filter(|name| !name.trim().is_empty());
    Ok(name.unwrap_or(fallback))
}

async fn list_folders(
    client: &ApiClient,
    course_id: u64,
    policy: &RetryPolicy,
) -> Result<TreeBuilder, CourseError> {
    let mut builder = TreeBuilder::new();
    for what in ["folders", "files"] {
        let url = client
            .endpoint(&format!("courses/{course_id}/{what}"), &[PER_PAGE])
            .map_err(|source| CourseError::listing(course_id, what, source))?;
        let mut pages = client.pages(url);
        while let Some(page) = pages
            .next_page_with_retry(policy)
            .await
            .map_err(|source| CourseError::listing(course_id, what, source))?
        {
            builder.ingest_page(&page);
        }
        debug!(what, pages = pages.pages_fetched(), "listing complete");
    }
    Ok(builder)
}

async fn list_modules(
    client: &ApiClient,
    course_id: u64,
    policy: &RetryPolicy,
    concurrency: usize,
) -> Result<TreeBuilder, CourseError> {
    let url = client
        .endpoint(
            &format!("courses/{course_id}/modules"),
            &[("include[]", "items"), PER_PAGE],
        )
        .map_err(|source| CourseError::listing(course_id, "modules", source))?;
    let values = client
        .pages(url)
        .collect_all(policy)
        .await
        .map_err(|source| CourseError::listing(course_id, "modules", source))?;

    let mut builder = TreeBuilder::new();
    let mut wanted: Vec<(u64, u64)> = Vec::new();
    for value in &values {
        let Some(module) = ModuleEntry::parse(value) else {
            builder.ingest_value(value);
            continue;
        };
        builder.ingest(Entry::Folder(module.to_folder()));
        wanted.extend(module.file_ids().into_iter().map(|file_id| (module.id, file_id)));
    }
    debug!(modules = values.len(), files = wanted.len(), "resolving module files");

    let resolved: Vec<(u64, u64, Result<Option<Value>, FetchError>)> = stream::iter(wanted)
        .map(|(module_id, file_id)| async move {
            (module_id, file_id, fetch_file(client, file_id, policy).await)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (module_id, file_id, result) in resolved {
        match result {
            Ok(Some(value)) => match Entry::classify(&value) {
                Some(Entry::File(mut file)) => {
                    file.folder_id = Some(module_id);
                    builder.ingest(Entry::File(file));
                }
                _ => builder.ingest_value(&value),
            },
            Ok(None) => {}
            Err(error) => {
                warn!(file_id, error = %error, "could not resolve module file");
                builder.note(format!("could not resolve module file {file_id}: {error}"));
            }
        }
    }
    Ok(builder)
}

async fn fetch_file(
    client: &ApiClient,
    file_id: u64,
    policy: &RetryPolicy,
) -> Result<Option<Value>, FetchError> {
    let url = client.endpoint(&format!("files/{file_id}"), &[])?;
    let page = client.pages(url).next_page_with_retry(policy).await?;
    Ok(page.and_then(|page| page.entries.into_iter().next()))
}
