//! Download phase: per-file tasks and the bounded-concurrency scheduler.
//!
//! The course pipeline turns every selected [`FileNode`](crate::tree::FileNode)
//! into a [`DownloadTask`] and hands the batch to a [`DownloadScheduler`].
//! Each task ends in exactly one [`TaskOutcome`]; one file failing never stops
//! its siblings.

mod scheduler;
mod task;

pub use scheduler::{
    DEFAULT_CONCURRENCY, DownloadScheduler, DownloadStats, SchedulerError, validate_concurrency,
};
pub use task::{DownloadTask, TaskOutcome, TaskState, TaskStatus};
