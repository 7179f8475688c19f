//! Post-download PDF merging.
//!
//! The [`MergeCoordinator`] is fed every terminal [`TaskOutcome`] as the
//! scheduler produces it. It knows how many tasks target each folder, so it
//! can tell when a folder is complete; at that moment (and never before) the
//! folder's PDFs are merged into `<folder>/<folder-name>-merged.pdf`.
//! Completed folders merge concurrently in a `JoinSet`.
//!
//! With [`MergeScope::Course`] every PDF of the course is also merged, in
//! traversal order, into `<course-dir>/<course-name>-merged.pdf` once all
//! downloads are done.
//!
//! Merge failures never fail the course; they become [`MergeWarning`]s.

mod merger;

pub use merger::{CliPdfMerger, MergeError, NoOpPdfMerger, PdfMerger};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::TaskOutcome;
use crate::layout::{commit_staged, discard_staged, staging_path};

const MERGED_SUFFIX: &str = "-merged.pdf";

/// Which merged outputs to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeScope {
    /// One merged PDF per folder.
    #[default]
    Folder,
    /// One merged PDF for the whole course.
    Course,
    /// Both of the above.
    Both,
}

impl MergeScope {
    /// Whether per-folder merges are produced.
    #[must_use]
    pub fn includes_folders(self) -> bool {
        matches!(self, Self::Folder | Self::Both)
    }

    /// Whether the course-wide merge is produced.
    #[must_use]
    pub fn includes_course(self) -> bool {
        matches!(self, Self::Course | Self::Both)
    }
}

impl std::str::FromStr for MergeScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folder" => Ok(Self::Folder),
            "course" => Ok(Self::Course),
            "both" => Ok(Self::Both),
            other => Err(format!(
                "unknown merge scope '{other}' (expected folder, course or both)"
            )),
        }
    }
}

/// What happens to the original PDFs after a successful merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep the originals next to the merged file.
    #[default]
    Keep,
    /// Delete the originals once every merge that uses them has succeeded.
    Replace,
}

impl std::str::FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "replace" => Ok(Self::Replace),
            other => Err(format!(
                "unknown merge policy '{other}' (expected keep or replace)"
            )),
        }
    }
}

/// A merge problem attached to the folder it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeWarning {
    /// Folder (or course directory) the problem belongs to.
    pub folder: PathBuf,
    /// Human readable description.
    pub message: String,
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.folder.display(), self.message)
    }
}

/// What the coordinator produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    /// Merged files written, folder merges first.
    pub merged: Vec<PathBuf>,
    /// Failed merges, skipped inputs and cleanup problems.
    pub warnings: Vec<MergeWarning>,
}

/// Per-folder bookkeeping gating the merge attempt.
#[derive(Debug, Default)]
struct MergeGroup {
    expected: usize,
    received: usize,
    /// Present PDFs with their traversal index.
    pdfs: Vec<(usize, PathBuf)>,
    triggered: bool,
}

impl MergeGroup {
    fn is_complete(&self) -> bool {
        self.received >= self.expected
    }
}

/// Result of one folder merge job.
struct FolderMerge {
    folder: PathBuf,
    result: Result<Salvaged, MergeError>,
}

/// A merge that went through, possibly without some of its inputs.
#[derive(Debug)]
struct Salvaged {
    path: PathBuf,
    used: Vec<PathBuf>,
    skipped: Vec<(PathBuf, MergeError)>,
}

impl Salvaged {
    fn warnings(&self, folder: &Path) -> impl Iterator<Item = MergeWarning> + '_ {
        let folder = folder.to_path_buf();
        self.skipped.iter().map(move |(input, error)| MergeWarning {
            folder: folder.clone(),
            message: format!("left {} out of the merge: {error}", display_name(input)),
        })
    }
}

/// Collects download outcomes and merges folders as they complete.
pub struct MergeCoordinator {
    merger: Arc<dyn PdfMerger>,
    scope: MergeScope,
    policy: MergePolicy,
    cancel: CancellationToken,
    groups: HashMap<PathBuf, MergeGroup>,
    /// Traversal index of every planned file.
    order: HashMap<u64, usize>,
    course_output: Option<PathBuf>,
    course_pdfs: Vec<(usize, PathBuf)>,
    jobs: JoinSet<FolderMerge>,
    job_folders: HashMap<tokio::task::Id, PathBuf>,
}

impl fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("merger", &self.merger.name())
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .field("folders", &self.groups.len())
            .field("running", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl MergeCoordinator {
    /// Creates a coordinator. Plan every file with [`MergeCoordinator::plan_file`]
    /// before recording outcomes.
    #[must_use]
    pub fn new(
        merger: Arc<dyn PdfMerger>,
        scope: MergeScope,
        policy: MergePolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            merger,
            scope,
            policy,
            cancel,
            groups: HashMap::new(),
            order: HashMap::new(),
            course_output: None,
            course_pdfs: Vec::new(),
            jobs: JoinSet::new(),
            job_folders: HashMap::new(),
        }
    }

    /// Sets where the course-wide merge is written. Without it, a course
    /// scope produces no course merge.
    #[must_use]
    pub fn with_course_output(mut self, path: PathBuf) -> Self {
        self.course_output = Some(path);
        self
    }

    /// Announces a file that will be downloaded into `folder`.
    ///
    /// Call in traversal order; that order is used for the course merge.
    pub fn plan_file(&mut self, folder: &Path, file_id: u64) {
        let index = self.order.len();
        self.order.entry(file_id).or_insert(index);
        self.groups.entry(folder.to_path_buf()).or_default().expected += 1;
    }

    /// Number of folders that will receive files.
    #[must_use]
    pub fn folder_count(&self) -> usize {
        self.groups.len()
    }

    /// Records a terminal outcome; starts the folder's merge if this was its
    /// last outstanding file.
    pub fn record(&mut self, outcome: &TaskOutcome) {
        let Some(group) = self.groups.get_mut(&outcome.folder) else {
            debug!(folder = %outcome.folder.display(), "outcome for unplanned folder ignored");
            return;
        };
        group.received += 1;

        if outcome.is_present() && outcome.is_pdf() {
            let index = self
                .order
                .get(&outcome.file_id)
                .copied()
                .unwrap_or(usize::MAX);
            group.pdfs.push((index, outcome.path.clone()));
            self.course_pdfs.push((index, outcome.path.clone()));
        }

        if group.is_complete() && !group.triggered {
            group.triggered = true;
            let pdfs = std::mem::take(&mut group.pdfs);
            let folder = outcome.folder.clone();
            self.on_folder_complete(folder, pdfs);
        }
    }

    fn on_folder_complete(&mut self, folder: PathBuf, pdfs: Vec<(usize, PathBuf)>) {
        if !self.scope.includes_folders() {
            return;
        }
        if self.cancel.is_cancelled() {
            debug!(folder = %folder.display(), "cancelled, not merging");
            return;
        }
        if pdfs.len() < 2 {
            debug!(folder = %folder.display(), pdfs = pdfs.len(), "nothing to merge");
            return;
        }

        let output = folder_output(&folder);
        if self.scope.includes_course() && self.course_output.as_deref() == Some(output.as_path()) {
            debug!(folder = %folder.display(), "course merge owns this output, skipping folder merge");
            return;
        }

        let mut inputs: Vec<PathBuf> = pdfs.into_iter().map(|(_, path)| path).collect();
        inputs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        info!(folder = %folder.display(), inputs = inputs.len(), "merging folder");
        let merger = Arc::clone(&self.merger);
        let job_folder = folder.clone();
        let handle = self.jobs.spawn(async move {
            let result = merge_salvaging(merger.as_ref(), inputs, &output).await;
            FolderMerge {
                folder: job_folder,
                result,
            }
        });
        self.job_folders.insert(handle.id(), folder);
    }

    /// Waits for every folder merge, then runs the course merge and applies
    /// the merge policy.
    #[instrument(skip_all, fields(scope = ?self.scope, policy = ?self.policy))]
    pub async fn finish(mut self) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut consumed: Vec<PathBuf> = Vec::new();

        while let Some(joined) = self.jobs.join_next_with_id().await {
            match joined {
                Ok((id, job)) => {
                    self.job_folders.remove(&id);
                    match job.result {
                        Ok(salvaged) => {
                            info!(merged = %salvaged.path.display(), "folder merged");
                            summary.warnings.extend(salvaged.warnings(&job.folder));
                            summary.merged.push(salvaged.path);
                            consumed.extend(salvaged.used);
                        }
                        Err(e) => {
                            warn!(folder = %job.folder.display(), error = %e, "folder merge failed");
                            summary.warnings.push(MergeWarning {
                                folder: job.folder,
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, "merge task panicked");
                    if let Some(folder) = self.job_folders.remove(&error.id()) {
                        summary.warnings.push(MergeWarning {
                            folder,
                            message: "merge task panicked".to_string(),
                        });
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            debug!("cancelled, skipping course merge and cleanup");
            return summary;
        }

        for (folder, group) in &self.groups {
            if !group.triggered {
                summary.warnings.push(MergeWarning {
                    folder: folder.clone(),
                    message: format!(
                        "not merged: only {} of {} downloads finished",
                        group.received, group.expected
                    ),
                });
            }
        }

        if self.scope.includes_course()
            && let Some(output) = self.course_output.take()
            && self.course_pdfs.len() > 1
        {
            self.course_pdfs.sort_by_key(|(index, _)| *index);
            let inputs: Vec<PathBuf> = self.course_pdfs.drain(..).map(|(_, p)| p).collect();
            info!(inputs = inputs.len(), output = %output.display(), "merging course");
            let course_dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
            match merge_salvaging(self.merger.as_ref(), inputs, &output).await {
                Ok(salvaged) => {
                    summary.warnings.extend(salvaged.warnings(&course_dir));
                    summary.merged.push(salvaged.path);
                    consumed.extend(salvaged.used);
                }
                Err(e) => {
                    warn!(error = %e, "course merge failed");
                    summary.warnings.push(MergeWarning {
                        folder: course_dir,
                        message: e.to_string(),
                    });
                }
            }
        }

        if self.policy == MergePolicy::Replace {
            consumed.sort();
            consumed.dedup();
            for original in consumed {
                if let Err(e) = tokio::fs::remove_file(&original).await {
                    warn!(path = %original.display(), error = %e, "could not remove merged original");
                    summary.warnings.push(MergeWarning {
                        folder: original.parent().map(Path::to_path_buf).unwrap_or_default(),
                        message: format!("could not remove {}: {e}", original.display()),
                    });
                }
            }
        }

        summary
    }
}

/// `<folder>/<folder-name>-merged.pdf`.
#[must_use]
pub fn folder_output(folder: &Path) -> PathBuf {
    let name = folder
        .file_name()
        .map_or_else(|| "folder".into(), |n| n.to_string_lossy());
    folder.join(format!("{name}{MERGED_SUFFIX}"))
}

/// `<course-dir>/<course-name>-merged.pdf`.
#[must_use]
pub fn course_output(course_dir: &Path, course_name: &str) -> PathBuf {
    course_dir.join(format!("{course_name}{MERGED_SUFFIX}"))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Merges `inputs` into `output`. When the tool rejects the set, each input
/// is checked on its own and the merge is retried without the bad ones, as
/// long as at least two good inputs remain.
async fn merge_salvaging(
    merger: &dyn PdfMerger,
    inputs: Vec<PathBuf>,
    output: &Path,
) -> Result<Salvaged, MergeError> {
    let error = match merge_staged(merger, &inputs, output).await {
        Ok(path) => {
            return Ok(Salvaged {
                path,
                used: inputs,
                skipped: Vec::new(),
            });
        }
        Err(e) if e.is_tool_failure() && inputs.len() > 2 => e,
        Err(e) => return Err(e),
    };

    let mut good = Vec::with_capacity(inputs.len());
    let mut skipped = Vec::new();
    for input in inputs {
        match merger.check(&input).await {
            Ok(()) => good.push(input),
            Err(e) => {
                warn!(input = %input.display(), error = %e, "input cannot be merged");
                skipped.push((input, e));
            }
        }
    }
    if skipped.is_empty() || good.len() < 2 {
        return Err(error);
    }

    info!(output = %output.display(), kept = good.len(), skipped = skipped.len(), "retrying merge without unreadable inputs");
    let path = merge_staged(merger, &good, output).await?;
    Ok(Salvaged {
        path,
        used: good,
        skipped,
    })
}

/// Merges into a staging file next to `output`, then renames it into place.
async fn merge_staged(
    merger: &dyn PdfMerger,
    inputs: &[PathBuf],
    output: &Path,
) -> Result<PathBuf, MergeError> {
    let staging = staging_path(output);
    if let Err(e) = merger.merge(inputs, &staging).await {
        discard_staged(&staging).await;
        return Err(e);
    }
    commit_staged(&staging, output)
        .await
        .map_err(|crate::layout::LayoutError::Io { path, source }| MergeError::io(path, source))?;
    Ok(output.to_path_buf())
}
