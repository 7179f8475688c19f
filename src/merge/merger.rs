//! The PDF merge transform and its implementations.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::layout::{discard_staged, staging_path};

/// Errors from a merge attempt.
#[derive(Debug, Error)]
pub enum MergeError {
    /// No merge backend is available.
    #[error("PDF merging is not available ({merger}); install pdfunite or qpdf")]
    Unsupported {
        /// Name of the merger that was asked.
        merger: &'static str,
    },

    /// The external tool ran and reported failure.
    #[error("{tool} exited with {status}: {stderr}")]
    Tool {
        /// Tool name.
        tool: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The external tool could not be started.
    #[error("failed to run {tool}: {source}")]
    Spawn {
        /// Path of the binary.
        tool: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error around the merge.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Called with an empty input list.
    #[error("no input files to merge")]
    NoInputs,
}

impl MergeError {
    /// Creates an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when the tool itself rejected its inputs, so dropping an
    /// unreadable input may let a retry succeed.
    #[must_use]
    pub fn is_tool_failure(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }
}

/// Concatenates PDFs.
///
/// `inputs` are merged in the given order into `output`, which the
/// implementation creates (or replaces). Returns the written path.
#[async_trait]
pub trait PdfMerger: Send + Sync {
    /// Merges `inputs` into `output`.
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<PathBuf, MergeError>;

    /// Checks that `input` can be merged at all (readable, not encrypted).
    ///
    /// The default merges the file on its own into a throwaway staging file.
    async fn check(&self, input: &Path) -> Result<(), MergeError> {
        let scratch = staging_path(input);
        let result = self.merge(&[input.to_path_buf()], &scratch).await;
        discard_staged(&scratch).await;
        result.map(|_| ())
    }

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// Which external binary a [`CliPdfMerger`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Pdfunite,
    Qpdf,
}

/// Merges by shelling out to `pdfunite` (poppler) or `qpdf`.
#[derive(Debug, Clone)]
pub struct CliPdfMerger {
    binary_path: PathBuf,
    tool: Tool,
}

impl CliPdfMerger {
    /// Uses `pdfunite` at an explicit path.
    #[must_use]
    pub fn pdfunite(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            tool: Tool::Pdfunite,
        }
    }

    /// Uses `qpdf` at an explicit path.
    #[must_use]
    pub fn qpdf(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            tool: Tool::Qpdf,
        }
    }

    /// Looks for `pdfunite`, then `qpdf`, on `PATH`.
    #[must_use]
    pub fn from_path() -> Option<Self> {
        which::which("pdfunite")
            .ok()
            .map(Self::pdfunite)
            .or_else(|| which::which("qpdf").ok().map(Self::qpdf))
    }

    /// The binary this merger runs.
    #[must_use]
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn command(&self, inputs: &[PathBuf], output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        match self.tool {
            Tool::Pdfunite => {
                cmd.args(inputs).arg(output);
            }
            Tool::Qpdf => {
                cmd.arg("--empty")
                    .arg("--pages")
                    .args(inputs)
                    .arg("--")
                    .arg(output);
            }
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<(), MergeError> {
        let result = cmd.output().await.map_err(|source| MergeError::Spawn {
            tool: self.binary_path.display().to_string(),
            source,
        })?;

        // qpdf exits 3 for "succeeded with warnings"
        let ok = result.status.success()
            || (self.tool == Tool::Qpdf && result.status.code() == Some(3));
        if !ok {
            return Err(MergeError::Tool {
                tool: self.name().to_string(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PdfMerger for CliPdfMerger {
    #[instrument(skip(self, inputs), fields(tool = self.name(), inputs = inputs.len(), output = %output.display()))]
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<PathBuf, MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }
        self.run(self.command(inputs, output)).await?;
        debug!("merge tool finished");
        Ok(output.to_path_buf())
    }

    async fn check(&self, input: &Path) -> Result<(), MergeError> {
        match self.tool {
            Tool::Qpdf => {
                let mut cmd = Command::new(&self.binary_path);
                cmd.arg("--check").arg(input).stdin(Stdio::null());
                self.run(cmd).await
            }
            Tool::Pdfunite => {
                let scratch = staging_path(input);
                let result = self.run(self.command(&[input.to_path_buf()], &scratch)).await;
                discard_staged(&scratch).await;
                result
            }
        }
    }

    fn name(&self) -> &'static str {
        match self.tool {
            Tool::Pdfunite => "pdfunite",
            Tool::Qpdf => "qpdf",
        }
    }
}

/// Fallback when no merge tool is installed; every call fails with
/// [`MergeError::Unsupported`], which the coordinator reports as a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPdfMerger;

impl NoOpPdfMerger {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PdfMerger for NoOpPdfMerger {
    async fn merge(&self, _inputs: &[PathBuf], _output: &Path) -> Result<PathBuf, MergeError> {
        Err(MergeError::Unsupported {
            merger: self.name(),
        })
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
