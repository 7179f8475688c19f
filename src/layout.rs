//! On-disk layout: directory creation, name collisions, atomic placement.
//!
//! Files are never written at their final path directly. A download streams
//! into a hidden staging file in the destination folder and is renamed into
//! place once complete, so a reader never sees a partial file at a final path.
//!
//! [`LayoutWriter::reserve`] decides the final path for a file. Reservations
//! are remembered for the lifetime of the writer so two concurrent tasks can
//! never be handed the same path.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::state::KnownCopy;

/// Longest file or folder name we produce, in UTF-8 bytes.
///
/// File systems cap a name at 255 bytes; the rest is left for the staging
/// decoration (`.<name>.xxxxxxxx.part`) and collision suffixes.
pub const MAX_NAME_BYTES: usize = 200;

const MAX_NUMERIC_SUFFIX: usize = 9_999;

/// Errors from preparing or placing files on disk.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// File system error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl LayoutError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// What to do when a different file already sits at the target path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Keep the existing file and write the new one as `stem_N.ext`.
    #[default]
    Suffix,
    /// Replace the existing file.
    Overwrite,
    /// Leave the existing file alone and skip the download.
    Skip,
}

impl std::str::FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suffix" => Ok(Self::Suffix),
            "overwrite" => Ok(Self::Overwrite),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "invalid collision policy '{other}' (expected suffix, overwrite or skip)"
            )),
        }
    }
}

/// The outcome of reserving a final path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Nothing usable exists here; download into this path.
    Fresh(PathBuf),
    /// A file presumed identical (or kept by policy) already exists; no download.
    Existing(PathBuf),
}

impl Reservation {
    /// The reserved path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Fresh(path) | Self::Existing(path) => path,
        }
    }

    /// Returns true when nothing needs to be downloaded.
    #[must_use]
    pub fn is_existing(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// Places files under a destination root.
#[derive(Debug)]
pub struct LayoutWriter {
    root: PathBuf,
    policy: CollisionPolicy,
    claimed: Mutex<HashSet<PathBuf>>,
}

impl LayoutWriter {
    /// Creates a writer rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, policy: CollisionPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// The destination root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configured collision policy.
    #[must_use]
    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Creates `path` and all missing parents. Succeeds if it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if the directory cannot be created.
    pub async fn ensure_dir(&self, path: &Path) -> Result<(), LayoutError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| LayoutError::io(path, e))
    }

    /// Decides the final path for a file expected to be `expected_size` bytes.
    ///
    /// A file already at `path` with the same size is presumed identical and
    /// returned as [`Reservation::Existing`]. Otherwise the collision policy
    /// applies. Paths claimed earlier by this writer are never handed out again.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if existing files cannot be inspected.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub async fn reserve(
        &self,
        path: &Path,
        expected_size: Option<u64>,
    ) -> Result<Reservation, LayoutError> {
        let mut claimed = self.claimed.lock().await;

        if !claimed.contains(path) {
            let reservation = match existing_size(path).await? {
                None => Some(Reservation::Fresh(path.to_path_buf())),
                Some(size) if expected_size == Some(size) => {
                    debug!(size, "identical file already present");
                    Some(Reservation::Existing(path.to_path_buf()))
                }
                Some(size) => {
                    debug!(size, ?expected_size, policy = ?self.policy, "different file at target");
                    match self.policy {
                        CollisionPolicy::Overwrite => Some(Reservation::Fresh(path.to_path_buf())),
                        CollisionPolicy::Skip => Some(Reservation::Existing(path.to_path_buf())),
                        CollisionPolicy::Suffix => None,
                    }
                }
            };
            if let Some(reservation) = reservation {
                claimed.insert(path.to_path_buf());
                return Ok(reservation);
            }
        }

        for index in 1..=MAX_NUMERIC_SUFFIX {
            let candidate = with_suffix(path, &index.to_string());
            if claimed.contains(&candidate) {
                continue;
            }
            let reservation = match existing_size(&candidate).await? {
                None => Reservation::Fresh(candidate.clone()),
                Some(size) if expected_size == Some(size) => {
                    Reservation::Existing(candidate.clone())
                }
                Some(_) => continue,
            };
            debug!(resolved = %candidate.display(), "resolved collision with suffix");
            claimed.insert(candidate);
            return Ok(reservation);
        }

        let candidate = with_suffix(path, &format!("{:08x}", rand::thread_rng().r#gen::<u32>()));
        claimed.insert(candidate.clone());
        Ok(Reservation::Fresh(candidate))
    }

    /// Claims the copy an earlier run wrote.
    ///
    /// An unchanged copy is returned as [`Reservation::Existing`]; a copy that
    /// changed on the server is handed out as [`Reservation::Fresh`] so the new
    /// version replaces it, whatever its size. If another task already holds
    /// the path this falls back to [`LayoutWriter::reserve`].
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if the fallback cannot inspect existing files.
    #[instrument(level = "debug", skip(self, known), fields(path = %known.path.display(), unchanged = known.unchanged))]
    pub async fn reserve_known(
        &self,
        known: &KnownCopy,
        expected_size: Option<u64>,
    ) -> Result<Reservation, LayoutError> {
        {
            let mut claimed = self.claimed.lock().await;
            if claimed.insert(known.path.clone()) {
                let path = known.path.clone();
                return Ok(if known.unchanged {
                    Reservation::Existing(path)
                } else {
                    debug!("changed since last run, replacing");
                    Reservation::Fresh(path)
                });
            }
        }
        self.reserve(&known.path, expected_size).await
    }

    /// A hidden, uniquely named staging path next to `final_path`.
    #[must_use]
    pub fn staging_path(&self, final_path: &Path) -> PathBuf {
        staging_path(final_path)
    }

    /// Atomically moves a finished staging file into place.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if the rename fails; the staging file is
    /// removed in that case.
    pub async fn commit(&self, staging: &Path, final_path: &Path) -> Result<(), LayoutError> {
        commit_staged(staging, final_path).await
    }

    /// Removes a staging file. Missing files are not an error.
    pub async fn discard(&self, staging: &Path) {
        discard_staged(staging).await;
    }
}

/// A hidden, uniquely named staging path next to `final_path`:
/// `.<name>.<random>.part`.
#[must_use]
pub fn staging_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map_or_else(|| "download".into(), |n| n.to_string_lossy());
    let tag: u32 = rand::thread_rng().r#gen();
    final_path.with_file_name(format!(".{name}.{tag:08x}.part"))
}

/// Renames `staging` onto `final_path`.
///
/// # Errors
///
/// Returns [`LayoutError::Io`] if the rename fails; the staging file is
/// removed in that case.
pub async fn commit_staged(staging: &Path, final_path: &Path) -> Result<(), LayoutError> {
    if let Err(e) = tokio::fs::rename(staging, final_path).await {
        discard_staged(staging).await;
        return Err(LayoutError::io(final_path, e));
    }
    Ok(())
}

/// Removes a staging file, ignoring a file that is already gone.
pub async fn discard_staged(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => debug!(path = %staging.display(), "removed staging file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!(path = %staging.display(), error = %e, "could not remove staging file"),
    }
}

async fn existing_size(path: &Path) -> Result<Option<u64>, LayoutError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LayoutError::io(path, e)),
    }
}

/// `dir/stem.ext` becomes `dir/stem_<suffix>.ext`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(suffixed_name(&name, suffix))
}

/// `stem.ext` becomes `stem_<suffix>.ext`; names without an extension (or
/// dotfiles) get the suffix appended. The stem is shortened so the result
/// stays within [`MAX_NAME_BYTES`].
#[must_use]
pub fn suffixed_name(name: &str, suffix: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    };
    let budget = MAX_NAME_BYTES.saturating_sub(suffix.len() + 1 + ext.len());
    format!("{}_{suffix}{ext}", prefix_within(stem, budget))
}

/// Makes one path component safe on common file systems.
///
/// Replaces `/ \ : * ? " < > |` and control characters with `_`, collapses
/// runs of whitespace, trims trailing dots and spaces, and caps the result at
/// [`MAX_NAME_BYTES`] bytes (on a character boundary) while keeping the
/// extension.
#[must_use]
pub fn sanitize_component(name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let mapped: String = collapsed
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = mapped.trim_end_matches(['.', ' ']);

    if trimmed.is_empty() {
        return "_".to_string();
    }
    truncate_keeping_extension(trimmed, MAX_NAME_BYTES)
}

fn truncate_keeping_extension(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }
    if let Some(pos) = name.rfind('.').filter(|&pos| pos > 0) {
        let ext = &name[pos..];
        if ext.len() < max_bytes {
            let base = prefix_within(&name[..pos], max_bytes - ext.len());
            return format!("{base}{ext}");
        }
    }
    prefix_within(name, max_bytes).to_string()
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character.
fn prefix_within(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    // ==================== sanitize_component Tests ====================

    #[test]
    fn test_sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_component("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_component("tab\there"), "tab here");
    }

    #[test]
    fn test_sanitize_collapses_whitespace_and_trims() {
        assert_eq!(sanitize_component("  Week   1  "), "Week 1");
        assert_eq!(sanitize_component("notes. . "), "notes");
    }

    #[test]
    fn test_sanitize_never_yields_traversal_or_empty() {
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("   "), "_");
        assert_eq!(sanitize_component("."), "_");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("../etc"), ".._etc");
    }

    #[test]
    fn test_sanitize_caps_length_keeping_extension() {
        let long = format!("{}.pdf", "x".repeat(400));
        let out = sanitize_component(&long);
        assert_eq!(out.len(), MAX_NAME_BYTES);
        assert!(out.ends_with(".pdf"));

        let no_ext = "y".repeat(300);
        assert_eq!(sanitize_component(&no_ext).len(), MAX_NAME_BYTES);
    }

    #[test]
    fn test_sanitize_caps_multibyte_by_bytes_on_char_boundary() {
        // 100 three-byte characters: 304 bytes, over the 255-byte file system limit.
        let long = format!("{}.pdf", "讲".repeat(100));
        let out = sanitize_component(&long);
        assert!(out.len() <= MAX_NAME_BYTES, "{} bytes", out.len());
        assert!(out.ends_with(".pdf"));
        assert!(out.trim_end_matches(".pdf").chars().all(|c| c == '讲'));
        assert_eq!(out.len(), 65 * 3 + ".pdf".len());

        let staging = staging_path(Path::new("/d").join(&out).as_path());
        assert!(staging.file_name().unwrap().len() <= 255);
        assert!(suffixed_name(&out, "9999").len() <= MAX_NAME_BYTES);
    }

    #[tokio::test]
    async fn test_long_multibyte_name_can_be_written() {
        let dir = TempDir::new().unwrap();
        let name = sanitize_component(&format!("{}.pdf", "讲".repeat(100)));
        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        let target = dir.path().join(&name);
        std::fs::write(&target, b"other").unwrap();

        let Reservation::Fresh(path) = writer.reserve(&target, Some(3)).await.unwrap() else {
            panic!("expected a suffixed fresh path");
        };
        let staging = writer.staging_path(&path);
        std::fs::write(&staging, b"new").unwrap();
        writer.commit(&staging, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_suffixed_name() {
        assert_eq!(suffixed_name("notes.pdf", "1"), "notes_1.pdf");
        assert_eq!(suffixed_name("archive.tar.gz", "2"), "archive.tar_2.gz");
        assert_eq!(suffixed_name("README", "3"), "README_3");
        assert_eq!(suffixed_name(".env", "1"), ".env_1");
    }

    #[test]
    fn test_collision_policy_parse() {
        assert_eq!("Skip".parse::<CollisionPolicy>().unwrap(), CollisionPolicy::Skip);
        assert_eq!(
            "overwrite".parse::<CollisionPolicy>().unwrap(),
            CollisionPolicy::Overwrite
        );
        assert!("merge".parse::<CollisionPolicy>().is_err());
    }

    // ==================== reserve Tests ====================

    #[tokio::test]
    async fn test_reserve_fresh_path() {
        let dir = TempDir::new().unwrap();
        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        let target = dir.path().join("a.pdf");
        let reservation = writer.reserve(&target, Some(10)).await.unwrap();
        assert_eq!(reservation, Reservation::Fresh(target));
    }

    #[tokio::test]
    async fn test_reserve_same_size_is_existing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.pdf");
        std::fs::write(&target, b"0123456789").unwrap();
        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        let reservation = writer.reserve(&target, Some(10)).await.unwrap();
        assert_eq!(reservation, Reservation::Existing(target));
        assert!(reservation.is_existing());
    }

    #[tokio::test]
    async fn test_reserve_known_copy_follows_freshness_not_size() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.pdf");
        std::fs::write(&target, b"0123456789").unwrap();

        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        let edited = KnownCopy {
            path: target.clone(),
            unchanged: false,
        };
        assert_eq!(
            writer.reserve_known(&edited, Some(10)).await.unwrap(),
            Reservation::Fresh(target.clone()),
            "same size but changed upstream must be replaced in place"
        );

        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        let current = KnownCopy {
            path: target.clone(),
            unchanged: true,
        };
        assert_eq!(
            writer.reserve_known(&current, Some(99)).await.unwrap(),
            Reservation::Existing(target.clone())
        );

        // A second claim on the same path falls back to the collision policy.
        assert_eq!(
            writer.reserve_known(&current, Some(99)).await.unwrap(),
            Reservation::Fresh(dir.path().join("a_1.pdf"))
        );
    }

    #[tokio::test]
    async fn test_reserve_different_size_per_policy() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.pdf");
        std::fs::write(&target, b"old").unwrap();

        let suffix = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        assert_eq!(
            suffix.reserve(&target, Some(10)).await.unwrap(),
            Reservation::Fresh(dir.path().join("a_1.pdf"))
        );

        let overwrite = LayoutWriter::new(dir.path(), CollisionPolicy::Overwrite);
        assert_eq!(
            overwrite.reserve(&target, Some(10)).await.unwrap(),
            Reservation::Fresh(target.clone())
        );

        let skip = LayoutWriter::new(dir.path(), CollisionPolicy::Skip);
        assert_eq!(
            skip.reserve(&target, Some(10)).await.unwrap(),
            Reservation::Existing(target)
        );
    }

    #[tokio::test]
    async fn test_reserve_reuses_matching_suffixed_copy() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.pdf");
        std::fs::write(&target, b"old").unwrap();
        std::fs::write(dir.path().join("a_1.pdf"), b"0123456789").unwrap();
        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        assert_eq!(
            writer.reserve(&target, Some(10)).await.unwrap(),
            Reservation::Existing(dir.path().join("a_1.pdf"))
        );
    }

    #[tokio::test]
    async fn test_reserve_unknown_size_never_presumed_identical() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.pdf");
        std::fs::write(&target, b"old").unwrap();
        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        assert_eq!(
            writer.reserve(&target, None).await.unwrap(),
            Reservation::Fresh(dir.path().join("a_1.pdf"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_share_a_path() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(LayoutWriter::new(dir.path(), CollisionPolicy::Suffix));
        let target = dir.path().join("same.pdf");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let writer = Arc::clone(&writer);
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                writer.reserve(&target, Some(1)).await.unwrap()
            }));
        }
        let mut paths = HashSet::new();
        for handle in handles {
            let reservation = handle.await.unwrap();
            assert!(matches!(reservation, Reservation::Fresh(_)));
            assert!(paths.insert(reservation.path().to_path_buf()));
        }
        assert_eq!(paths.len(), 8);
        assert!(paths.contains(&target));
    }

    // ==================== staging Tests ====================

    #[tokio::test]
    async fn test_staging_commit_and_discard() {
        let dir = TempDir::new().unwrap();
        let writer = LayoutWriter::new(dir.path(), CollisionPolicy::Suffix);
        let nested = dir.path().join("Module 1").join("Week 2");
        writer.ensure_dir(&nested).await.unwrap();
        writer.ensure_dir(&nested).await.unwrap();

        let final_path = nested.join("slides.pdf");
        let staging = writer.staging_path(&final_path);
        assert_eq!(staging.parent(), Some(nested.as_path()));
        let staging_name = staging.file_name().unwrap().to_string_lossy().into_owned();
        assert!(staging_name.starts_with(".slides.pdf."));
        assert!(staging_name.ends_with(".part"));

        std::fs::write(&staging, b"data").unwrap();
        writer.commit(&staging, &final_path).await.unwrap();
        assert!(!staging.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"data");

        let other = writer.staging_path(&final_path);
        std::fs::write(&other, b"partial").unwrap();
        writer.discard(&other).await;
        writer.discard(&other).await;
        assert!(!other.exists());
    }

    #[test]
    fn test_staging_paths_are_unique() {
        let target = Path::new("/tmp/course/a.pdf");
        let names: HashSet<PathBuf> = (0..32).map(|_| staging_path(target)).collect();
        assert!(names.len() > 1);
    }
}
