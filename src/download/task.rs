//! Per-file download task and its outcome.
//!
//! A [`DownloadTask`] is created at scheduler intake and owned by exactly one
//! worker. It moves `Pending -> InFlight { attempt }` on every attempt and is
//! consumed by [`DownloadTask::succeed`], [`DownloadTask::skip`] or
//! [`DownloadTask::fail`], which produce the terminal [`TaskOutcome`]. Because
//! those methods take `self`, a finished task can not transition again.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::state::KnownCopy;
use crate::tree::FileNode;

/// Non-terminal task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not started yet.
    Pending,
    /// A request is (or was last) in flight for this attempt (1-indexed).
    InFlight {
        /// Current attempt number.
        attempt: u32,
    },
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Downloaded and moved into place.
    Succeeded,
    /// An identical file was already present; nothing was downloaded.
    Skipped,
    /// Gave up; see [`TaskOutcome::error`].
    Failed,
}

/// A file scheduled for download.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    file: FileNode,
    dest: PathBuf,
    known: Option<KnownCopy>,
    state: TaskState,
}

/// The terminal record of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Canvas file id.
    pub file_id: u64,
    /// Directory the file belongs in.
    pub folder: PathBuf,
    /// Final path (the intended path for failures).
    pub path: PathBuf,
    /// Terminal state.
    pub status: TaskStatus,
    /// Failure or skip reason, token-free.
    pub error: Option<String>,
    /// Attempts made; 0 when no request was issued.
    pub attempts: u32,
    /// MIME type from the listing, used to spot PDFs without an extension.
    pub content_type: Option<String>,
}

impl TaskOutcome {
    /// Returns true when the file is on disk after this task.
    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::Skipped)
    }

    /// Returns true when the file is a PDF, by extension or content type.
    #[must_use]
    pub fn is_pdf(&self) -> bool {
        let by_extension = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        let by_content_type = self.content_type.as_deref().is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/pdf"))
        });
        by_extension || by_content_type
    }
}

impl DownloadTask {
    /// Creates a pending task for `file`, to be written at `dest`.
    #[must_use]
    pub fn new(file: FileNode, dest: PathBuf) -> Self {
        Self {
            file,
            dest,
            known: None,
            state: TaskState::Pending,
        }
    }

    /// Attaches the copy an earlier run left on disk.
    #[must_use]
    pub fn with_known_copy(mut self, known: Option<KnownCopy>) -> Self {
        self.known = known;
        self
    }

    /// The copy an earlier run left on disk, if any.
    #[must_use]
    pub fn known_copy(&self) -> Option<&KnownCopy> {
        self.known.as_ref()
    }

    /// The file being downloaded.
    #[must_use]
    pub fn file(&self) -> &FileNode {
        &self.file
    }

    /// The intended final path.
    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// The directory the file goes into.
    #[must_use]
    pub fn folder(&self) -> &Path {
        self.dest.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self.state {
            TaskState::Pending => 0,
            TaskState::InFlight { attempt } => attempt,
        }
    }

    /// Starts the next attempt and returns its number.
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = self.attempts() + 1;
        self.state = TaskState::InFlight { attempt };
        attempt
    }

    /// Finishes the task as downloaded to `path`.
    #[must_use]
    pub fn succeed(self, path: PathBuf) -> TaskOutcome {
        self.finish(path, TaskStatus::Succeeded, None)
    }

    /// Finishes the task without downloading; `path` already holds the file.
    #[must_use]
    pub fn skip(self, path: PathBuf) -> TaskOutcome {
        self.finish(path, TaskStatus::Skipped, None)
    }

    /// Finishes the task as failed.
    #[must_use]
    pub fn fail(self, error: impl Display) -> TaskOutcome {
        let dest = self.dest.clone();
        self.finish(dest, TaskStatus::Failed, Some(error.to_string()))
    }

    /// The outcome reported if the worker owning this task dies.
    pub(crate) fn failure_outcome(&self, error: &str) -> TaskOutcome {
        self.clone().fail(error)
    }

    fn finish(self, path: PathBuf, status: TaskStatus, error: Option<String>) -> TaskOutcome {
        let attempts = self.attempts();
        TaskOutcome {
            file_id: self.file.id,
            folder: self.folder().to_path_buf(),
            path,
            status,
            error,
            attempts,
            content_type: self.file.content_type,
        }
    }
}
