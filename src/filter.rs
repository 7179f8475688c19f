//! File filters: extension set, shell glob, regular expression.
//!
//! A [`FilterSpec`] matches a file when every predicate it carries matches.
//! Absent predicates match everything, so an empty spec selects the whole
//! course. Patterns are compiled when the spec is built; matching itself can
//! not fail.

use std::collections::BTreeSet;

use glob::Pattern;
use regex::Regex;
use thiserror::Error;

use crate::tree::FileNode;

/// Errors from building a [`FilterSpec`].
#[derive(Debug, Error)]
pub enum FilterError {
    /// The `--name` pattern is not a valid shell glob.
    #[error("invalid name pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// The `--regex` pattern does not compile.
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Combined file predicates.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    extensions: BTreeSet<String>,
    name_pattern: Option<Pattern>,
    regex: Option<Regex>,
}

impl FilterSpec {
    /// A spec that matches every file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a spec from CLI-style options.
    ///
    /// `only` is a list of extensions, each entry possibly comma-separated
    /// (`["pdf,ipynb", ".PPTX"]`).
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] if the glob or the regex is invalid.
    pub fn from_options(
        only: &[String],
        name: Option<&str>,
        regex: Option<&str>,
    ) -> Result<Self, FilterError> {
        let mut spec = Self::new().with_extensions(
            only.iter()
                .flat_map(|item| item.split(','))
                .map(str::to_string),
        );
        if let Some(pattern) = name {
            spec = spec.with_name_pattern(pattern)?;
        }
        if let Some(pattern) = regex {
            spec = spec.with_regex(pattern)?;
        }
        Ok(spec)
    }

    /// Adds allowed extensions (leading dots stripped, case-folded, blanks ignored).
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions.extend(
            extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty()),
        );
        self
    }

    /// Sets the shell glob matched against the file's base name.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidGlob`] for malformed patterns.
    pub fn with_name_pattern(mut self, pattern: &str) -> Result<Self, FilterError> {
        let compiled = Pattern::new(pattern).map_err(|source| FilterError::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })?;
        self.name_pattern = Some(compiled);
        Ok(self)
    }

    /// Sets the regex searched (unanchored) in the file's base name.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidRegex`] for malformed patterns.
    pub fn with_regex(mut self, pattern: &str) -> Result<Self, FilterError> {
        let compiled = Regex::new(pattern).map_err(|source| FilterError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        self.regex = Some(compiled);
        Ok(self)
    }

    /// Returns true when no predicate is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty() && self.name_pattern.is_none() && self.regex.is_none()
    }

    /// The normalized extension set.
    #[must_use]
    pub fn extensions(&self) -> &BTreeSet<String> {
        &self.extensions
    }

    /// Evaluates the spec against a file node.
    #[must_use]
    pub fn matches(&self, file: &FileNode) -> bool {
        self.matches_name(&file.name)
    }

    /// Evaluates the spec against a file name (any directory part is ignored).
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        let base = base_name(name);

        if !self.extensions.is_empty() {
            let lower = base.to_lowercase();
            let allowed = self
                .extensions
                .iter()
                .any(|ext| lower.len() > ext.len() && lower.ends_with(ext) && {
                    lower.as_bytes()[lower.len() - ext.len() - 1] == b'.'
                });
            if !allowed {
                return false;
            }
        }

        if let Some(pattern) = &self.name_pattern
            && !pattern.matches(base)
        {
            return false;
        }

        if let Some(regex) = &self.regex
            && !regex.is_match(base)
        {
            return false;
        }

        true
    }
}

/// Free-function form of [`FilterSpec::matches`].
#[must_use]
pub fn matches(file: &FileNode, spec: &FilterSpec) -> bool {
    spec.matches(file)
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::tree::FolderKey;

    fn node(name: &str) -> FileNode {
        FileNode {
            id: 1,
            name: name.to_string(),
            folder: FolderKey::Root,
            size: None,
            content_type: None,
            download_url: None,
            updated_at: None,
            path: PathBuf::from(name),
        }
    }

    #[test]
    fn test_empty_spec_matches_everything() {
        let spec = FilterSpec::new();
        assert!(spec.is_empty());
        for name in ["a.pdf", "noext", ".hidden", "", "weird name?.tar.gz"] {
            assert!(spec.matches(&node(name)), "empty spec rejected {name:?}");
        }
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let spec = FilterSpec::new().with_extensions(["pdf"]);
        assert!(spec.matches(&node("X.PDF")));
        assert!(spec.matches(&node("lecture1.pdf")));
        assert!(!spec.matches(&node("assignment1.ipynb")));
        assert!(!spec.matches(&node("pdf")));
        assert!(!spec.matches(&node("notapdf")));
    }

    #[test]
    fn test_extensions_normalized() {
        let spec = FilterSpec::from_options(
            &["pdf, .IPYNB".to_string(), " ".to_string()],
            None,
            None,
        )
        .unwrap();
        let exts: Vec<&str> = spec.extensions().iter().map(String::as_str).collect();
        assert_eq!(exts, vec!["ipynb", "pdf"]);
        assert!(spec.matches(&node("nb.ipynb")));
    }

    #[test]
    fn test_multi_part_extension() {
        let spec = FilterSpec::new().with_extensions(["tar.gz"]);
        assert!(spec.matches(&node("data.TAR.GZ")));
        assert!(!spec.matches(&node("data.gz")));
    }

    #[test]
    fn test_glob_on_base_name() {
        let spec = FilterSpec::new().with_name_pattern("lecture*").unwrap();
        assert!(spec.matches(&node("lecture1.pdf")));
        assert!(spec.matches_name("Module 1/lecture2.pdf"));
        assert!(!spec.matches(&node("slides.pptx")));

        let spec = FilterSpec::new().with_name_pattern("week[!3].pdf").unwrap();
        assert!(spec.matches(&node("week1.pdf")));
        assert!(!spec.matches(&node("week3.pdf")));

        let spec = FilterSpec::new().with_name_pattern("?.txt").unwrap();
        assert!(spec.matches(&node("a.txt")));
        assert!(!spec.matches(&node("ab.txt")));
    }

    #[test]
    fn test_regex_is_unanchored_search() {
        let spec = FilterSpec::new().with_regex(r"[Ll]ecture\d").unwrap();
        assert!(spec.matches(&node("Week 1 - Lecture3 notes.pdf")));
        assert!(!spec.matches(&node("lectures.pdf")));
    }

    #[test]
    fn test_all_predicates_must_match() {
        let spec = FilterSpec::from_options(&["pdf".to_string()], Some("*1*"), Some("^lec")).unwrap();
        assert!(spec.matches(&node("lecture1.pdf")));
        assert!(!spec.matches(&node("lecture2.pdf")));
        assert!(!spec.matches(&node("lecture1.pptx")));
        assert!(!spec.matches(&node("slides1.pdf")));
        assert!(matches(&node("lecture1.pdf"), &spec));
    }

    #[test]
    fn test_invalid_patterns_rejected_at_construction() {
        let err = FilterSpec::new().with_name_pattern("[abc").unwrap_err();
        assert!(matches!(err, FilterError::InvalidGlob { .. }));
        assert!(err.to_string().contains("[abc"));

        let err = FilterSpec::new().with_regex("(unclosed").unwrap_err();
        assert!(matches!(err, FilterError::InvalidRegex { .. }));
    }
}
