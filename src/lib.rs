//! Canvas course downloader library
//!
//! This library provides the fetch-filter-download pipeline behind the
//! `canvas-dl` tool: it lists a course's content through the paginated Canvas
//! REST API, filters the files, downloads them concurrently into a mirrored
//! directory tree and optionally merges the PDFs of each folder.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`api`] - HTTP client, pagination, rate budget and retry policy
//! - [`tree`] - Folder/file tree assembly and destination paths
//! - [`filter`] - Extension/glob/regex predicates
//! - [`layout`] - Directory creation, collision handling, atomic writes
//! - [`download`] - Bounded-concurrency download scheduler
//! - [`merge`] - Per-folder PDF merge coordination
//! - [`state`] - Per-course `.state.json` for incremental re-runs
//! - [`course`] - The end-to-end `download_course` operation

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod auth;
pub mod course;
pub mod download;
pub mod filter;
pub mod layout;
pub mod merge;
pub mod state;
#[cfg(test)]
mod test_support;
pub mod tree;
mod user_agent;

// Re-export commonly used types
pub use api::{
    ApiClient, DEFAULT_API_URL, DEFAULT_MAX_RETRIES, FailureType, FetchError, Page, PageFetcher,
    RateBudget, RetryDecision, RetryPolicy, classify_error,
};
pub use auth::{AccessToken, CredentialError, mask_token};
pub use course::{
    ContentSource, CourseError, CourseReport, CourseRequest, CourseSummary, FailedFile,
    MergeOptions, download_course, list_courses,
};
pub use download::{
    DEFAULT_CONCURRENCY, DownloadScheduler, DownloadStats, DownloadTask, SchedulerError,
    TaskOutcome, TaskStatus,
};
pub use filter::{FilterError, FilterSpec};
pub use layout::{CollisionPolicy, LayoutError, LayoutWriter, Reservation};
pub use merge::{
    CliPdfMerger, MergeCoordinator, MergeError, MergePolicy, MergeScope, MergeSummary,
    MergeWarning, NoOpPdfMerger, PdfMerger,
};
pub use state::{KnownCopy, STATE_FILE_NAME, SyncRecord, SyncState};
pub use tree::{FileNode, Folder, Tree, TreeBuilder, TreeError};
