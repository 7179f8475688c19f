//! Per-course sync state for incremental re-runs.
//!
//! `.state.json` in the course directory maps each downloaded file id to the
//! Canvas `updated_at` stamp it had and the path it was written to. On the
//! next run a file is skipped when its stamp is unchanged and the recorded
//! copy still exists, and re-downloaded over that copy when the stamp moved.
//! Files without a record fall back to the size check in
//! [`LayoutWriter::reserve`](crate::layout::LayoutWriter::reserve).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::layout::{LayoutError, commit_staged, discard_staged, staging_path};
use crate::tree::FileNode;

/// Name of the state file inside the course directory.
pub const STATE_FILE_NAME: &str = ".state.json";

/// What was written for one file on an earlier run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Canvas `updated_at` at download time.
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Path relative to the course directory.
    pub path: PathBuf,
}

/// A previous copy of a file and whether Canvas has changed it since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownCopy {
    /// Absolute path of the earlier download.
    pub path: PathBuf,
    /// True when the stamp recorded for it matches the listing.
    pub unchanged: bool,
}

/// File id to [`SyncRecord`] map for one course.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    files: BTreeMap<u64, SyncRecord>,
}

impl SyncState {
    /// Reads the state file in `course_dir`.
    ///
    /// A missing file yields an empty state; so does an unreadable one, after
    /// a warning (everything is then checked by size again).
    pub async fn load(course_dir: &Path) -> Self {
        let path = course_dir.join(STATE_FILE_NAME);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read sync state, starting fresh");
                return Self::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt sync state");
                Self::default()
            }
        }
    }

    /// Writes the state file into `course_dir` through a staging file.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if the file cannot be written or renamed.
    pub async fn save(&self, course_dir: &Path) -> Result<(), LayoutError> {
        let path = course_dir.join(STATE_FILE_NAME);
        let staging = staging_path(&path);
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| LayoutError::io(&path, std::io::Error::other(e)))?;
        if let Err(e) = tokio::fs::write(&staging, body).await {
            discard_staged(&staging).await;
            return Err(LayoutError::io(&staging, e));
        }
        commit_staged(&staging, &path).await?;
        debug!(path = %path.display(), files = self.files.len(), "saved sync state");
        Ok(())
    }

    /// The record for `file_id`, if any.
    #[must_use]
    pub fn get(&self, file_id: u64) -> Option<&SyncRecord> {
        self.files.get(&file_id)
    }

    /// Number of recorded files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true when nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Remembers that `file_id` with stamp `updated_at` now lives at `path`.
    ///
    /// `path` is stored relative to `course_dir` when it lies inside it.
    pub fn record(
        &mut self,
        course_dir: &Path,
        file_id: u64,
        updated_at: Option<String>,
        path: &Path,
    ) {
        let path = path.strip_prefix(course_dir).unwrap_or(path).to_path_buf();
        self.files.insert(file_id, SyncRecord { updated_at, path });
    }

    /// The earlier copy of `file` that should be reused or replaced.
    ///
    /// Only copies that still exist and sit in the folder `dest` belongs to
    /// are returned; a file that moved between folders starts over.
    #[must_use]
    pub fn known_copy(&self, course_dir: &Path, file: &FileNode, dest: &Path) -> Option<KnownCopy> {
        let record = self.files.get(&file.id)?;
        let path = course_dir.join(&record.path);
        if path.parent() != dest.parent() || !path.is_file() {
            return None;
        }
        Some(KnownCopy {
            path,
            unchanged: record.updated_at == file.updated_at,
        })
    }
}
