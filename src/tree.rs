//! Course content tree assembly.
//!
//! [`TreeBuilder`] takes classified listing entries in whatever order the
//! pages deliver them and produces an immutable [`Tree`]: every folder linked
//! to its parent, every file linked to exactly one folder, and a relative
//! destination path for each node.
//!
//! Resolution rules:
//! - the course's own top-level folder is an alias for the tree root,
//! - folders whose parent never shows up hang directly off the root,
//! - files whose folder never shows up go to a synthetic `Misc` folder,
//! - duplicate ids keep the entry with the smallest `(parent, name)`,
//! - sibling files whose sanitized names collide get `_N` suffixes in id order.
//!
//! The result depends only on the set of entries, not on their arrival order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{Entry, FileEntry, FolderEntry, Page};
use crate::layout::{sanitize_component, suffixed_name};

/// Name of the synthetic folder that collects orphaned files.
pub const MISC_FOLDER_NAME: &str = "Misc";

/// Errors from assembling the tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Folder parentage loops back on itself.
    #[error("cycle in folder parentage involving folder {folder_id}")]
    Cycle {
        /// The smallest folder id on the cycle.
        folder_id: u64,
    },
}

/// Identifies a folder in the tree. `Misc` sorts after every real folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FolderKey {
    /// The synthetic course root.
    Root,
    /// A folder or module from the API.
    Id(u64),
    /// The synthetic folder for orphaned files.
    Misc,
}

/// A resolved folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub key: FolderKey,
    pub name: String,
    pub parent: Option<FolderKey>,
    pub position: Option<i64>,
    /// Directory relative to the course directory (empty for the root).
    pub path: PathBuf,
}

/// A resolved file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub id: u64,
    /// Name as reported by the API.
    pub name: String,
    pub folder: FolderKey,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub download_url: Option<String>,
    pub updated_at: Option<String>,
    /// Final path relative to the course directory.
    pub path: PathBuf,
}

/// Immutable folder/file tree for one course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    folders: BTreeMap<FolderKey, Folder>,
    files: BTreeMap<u64, FileNode>,
    child_folders: BTreeMap<FolderKey, Vec<FolderKey>>,
    child_files: BTreeMap<FolderKey, Vec<u64>>,
}

impl Tree {
    /// Looks up a folder.
    #[must_use]
    pub fn folder(&self, key: FolderKey) -> Option<&Folder> {
        self.folders.get(&key)
    }

    /// Looks up a file.
    #[must_use]
    pub fn file(&self, id: u64) -> Option<&FileNode> {
        self.files.get(&id)
    }

    /// Number of files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of folders, the root included.
    #[must_use]
    pub fn folder_count(&self) -> usize {
        self.folders.len()
    }

    /// Child folders of `key` in traversal order.
    #[must_use]
    pub fn child_folders(&self, key: FolderKey) -> &[FolderKey] {
        self.child_folders.get(&key).map_or(&[], Vec::as_slice)
    }

    /// Child file ids of `key` in traversal order.
    #[must_use]
    pub fn child_files(&self, key: FolderKey) -> &[u64] {
        self.child_files.get(&key).map_or(&[], Vec::as_slice)
    }

    /// Every file, depth-first: a folder's own files before its subfolders.
    #[must_use]
    pub fn files_depth_first(&self) -> Vec<&FileNode> {
        let mut out = Vec::with_capacity(self.files.len());
        let mut stack = vec![FolderKey::Root];
        while let Some(key) = stack.pop() {
            out.extend(self.child_files(key).iter().filter_map(|id| self.files.get(id)));
            stack.extend(self.child_folders(key).iter().rev().copied());
        }
        out
    }
}

/// Collects entries and builds a [`Tree`].
#[derive(Debug, Default)]
pub struct TreeBuilder {
    folders: HashMap<u64, FolderEntry>,
    files: HashMap<u64, FileEntry>,
    root_aliases: BTreeSet<u64>,
    warnings: Vec<String>,
}

impl TreeBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one classified entry.
    pub fn ingest(&mut self, entry: Entry) {
        match entry {
            Entry::Folder(folder) if folder.course_root => {
                self.root_aliases.insert(folder.id);
            }
            Entry::Folder(folder) => match self.folders.get(&folder.id) {
                Some(current) if folder_rank(current) <= folder_rank(&folder) => {
                    debug!(id = folder.id, "duplicate folder id, keeping earlier-ranked entry");
                }
                _ => {
                    self.folders.insert(folder.id, folder);
                }
            },
            Entry::File(file) => match self.files.get(&file.id) {
                Some(current) if file_rank(current) <= file_rank(&file) => {
                    debug!(id = file.id, "duplicate file id, keeping earlier-ranked entry");
                }
                _ => {
                    self.files.insert(file.id, file);
                }
            },
        }
    }

    /// Classifies and adds a raw JSON value. Unrecognised values become warnings.
    pub fn ingest_value(&mut self, value: &Value) {
        if let Some(entry) = Entry::classify(value) {
            self.ingest(entry);
        } else {
            let id = value.get("id").map_or_else(|| "?".to_string(), Value::to_string);
            warn!(id = %id, "skipping unrecognised listing entry");
            self.warnings
                .push(format!("skipped unrecognised listing entry (id {id})"));
        }
    }

    /// Adds every entry of a page.
    pub fn ingest_page(&mut self, page: &Page) {
        for value in &page.entries {
            self.ingest_value(value);
        }
    }

    /// Records a listing problem found outside the builder.
    pub fn note(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Warnings collected while ingesting.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Resolves links and paths.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Cycle`] if folder parentage loops.
    pub fn build(self) -> Result<Tree, TreeError> {
        let Self {
            folders: raw_folders,
            files: raw_files,
            root_aliases,
            ..
        } = self;

        let resolve = |id: u64| -> Option<FolderKey> {
            if root_aliases.contains(&id) {
                Some(FolderKey::Root)
            } else if raw_folders.contains_key(&id) {
                Some(FolderKey::Id(id))
            } else {
                None
            }
        };

        let mut folders = BTreeMap::new();
        folders.insert(
            FolderKey::Root,
            Folder {
                key: FolderKey::Root,
                name: String::new(),
                parent: None,
                position: None,
                path: PathBuf::new(),
            },
        );
        for entry in raw_folders.values() {
            let parent = match entry.parent_id {
                None => FolderKey::Root,
                Some(parent_id) => resolve(parent_id).unwrap_or_else(|| {
                    debug!(id = entry.id, parent_id, "parent folder not listed, attaching to root");
                    FolderKey::Root
                }),
            };
            folders.insert(
                FolderKey::Id(entry.id),
                Folder {
                    key: FolderKey::Id(entry.id),
                    name: entry.name.clone(),
                    parent: Some(parent),
                    position: entry.position,
                    path: PathBuf::new(),
                },
            );
        }

        let mut files = BTreeMap::new();
        for entry in raw_files.into_values() {
            let folder = entry.folder_id.and_then(resolve).unwrap_or(FolderKey::Misc);
            if folder == FolderKey::Misc && !folders.contains_key(&FolderKey::Misc) {
                folders.insert(
                    FolderKey::Misc,
                    Folder {
                        key: FolderKey::Misc,
                        name: MISC_FOLDER_NAME.to_string(),
                        parent: Some(FolderKey::Root),
                        position: None,
                        path: PathBuf::new(),
                    },
                );
            }
            files.insert(
                entry.id,
                FileNode {
                    id: entry.id,
                    name: entry.name,
                    folder,
                    size: entry.size,
                    content_type: entry.content_type,
                    download_url: entry.download_url,
                    updated_at: entry.updated_at,
                    path: PathBuf::new(),
                },
            );
        }

        let child_folders = order_child_folders(&folders);
        assign_folder_paths(&mut folders, &child_folders)?;
        let child_files = order_child_files(&files);
        assign_file_paths(&mut files, &folders);

        debug!(
            folders = folders.len(),
            files = files.len(),
            "built course tree"
        );
        Ok(Tree {
            folders,
            files,
            child_folders,
            child_files,
        })
    }
}

fn folder_rank(folder: &FolderEntry) -> (Option<u64>, &str) {
    (folder.parent_id, folder.name.as_str())
}

fn file_rank(file: &FileEntry) -> (Option<u64>, &str) {
    (file.folder_id, file.name.as_str())
}

fn order_child_folders(
    folders: &BTreeMap<FolderKey, Folder>,
) -> BTreeMap<FolderKey, Vec<FolderKey>> {
    let mut children: BTreeMap<FolderKey, Vec<&Folder>> = BTreeMap::new();
    for folder in folders.values() {
        if let Some(parent) = folder.parent {
            children.entry(parent).or_default().push(folder);
        }
    }
    children
        .into_iter()
        .map(|(parent, mut list)| {
            list.sort_by(|a, b| {
                let a_key = (a.key == FolderKey::Misc, a.position.unwrap_or(i64::MAX), a.name.as_str(), a.key);
                let b_key = (b.key == FolderKey::Misc, b.position.unwrap_or(i64::MAX), b.name.as_str(), b.key);
                a_key.cmp(&b_key)
            });
            (parent, list.into_iter().map(|f| f.key).collect())
        })
        .collect()
}

fn order_child_files(files: &BTreeMap<u64, FileNode>) -> BTreeMap<FolderKey, Vec<u64>> {
    let mut children: BTreeMap<FolderKey, Vec<&FileNode>> = BTreeMap::new();
    for file in files.values() {
        children.entry(file.folder).or_default().push(file);
    }
    children
        .into_iter()
        .map(|(folder, mut list)| {
            list.sort_by(|a, b| (a.name.as_str(), a.id).cmp(&(b.name.as_str(), b.id)));
            (folder, list.into_iter().map(|f| f.id).collect())
        })
        .collect()
}

/// Top-down from the root. Folders the walk never reaches sit on a cycle.
fn assign_folder_paths(
    folders: &mut BTreeMap<FolderKey, Folder>,
    child_folders: &BTreeMap<FolderKey, Vec<FolderKey>>,
) -> Result<(), TreeError> {
    let mut reached: HashSet<FolderKey> = HashSet::from([FolderKey::Root]);
    let mut queue = vec![(FolderKey::Root, PathBuf::new())];

    while let Some((key, path)) = queue.pop() {
        for child in child_folders.get(&key).into_iter().flatten() {
            if !reached.insert(*child) {
                continue;
            }
            if let Some(folder) = folders.get_mut(child) {
                folder.path = path.join(sanitize_component(&folder.name));
                queue.push((*child, folder.path.clone()));
            }
        }
    }

    let stranded = folders
        .keys()
        .filter(|key| !reached.contains(key))
        .find_map(|key| match key {
            FolderKey::Id(id) => Some(*id),
            FolderKey::Root | FolderKey::Misc => None,
        });
    if let Some(folder_id) = stranded {
        warn!(folder_id, "cycle detected in folder parentage");
        return Err(TreeError::Cycle { folder_id });
    }
    Ok(())
}

/// Gives each file a unique name within its directory.
///
/// Two folders can sanitize to the same directory, so uniqueness is enforced
/// per directory path, not per folder. Names are claimed in id order: first
/// every file whose name is still free, then the rest with the lowest free
/// `_N` suffix.
fn assign_file_paths(files: &mut BTreeMap<u64, FileNode>, folders: &BTreeMap<FolderKey, Folder>) {
    let mut by_dir: BTreeMap<PathBuf, Vec<u64>> = BTreeMap::new();
    for file in files.values() {
        let dir = folders
            .get(&file.folder)
            .map_or_else(PathBuf::new, |folder| folder.path.clone());
        by_dir.entry(dir).or_default().push(file.id);
    }

    for (dir, ids) in by_dir {
        let mut used: HashSet<String> = HashSet::new();
        let mut pending = Vec::new();

        for id in ids {
            let Some(file) = files.get_mut(&id) else {
                continue;
            };
            let name = sanitize_component(&file.name);
            if used.insert(name.clone()) {
                file.path = dir.join(&name);
            } else {
                pending.push((id, name));
            }
        }

        for (id, name) in pending {
            let Some(file) = files.get_mut(&id) else {
                continue;
            };
            let unique = (1..)
                .map(|n: u32| suffixed_name(&name, &n.to_string()))
                .find(|candidate| !used.contains(candidate))
                .unwrap_or_else(|| suffixed_name(&name, &id.to_string()));
            used.insert(unique.clone());
            debug!(id, name = %unique, "deduplicated sibling file name");
            file.path = dir.join(unique);
        }
    }
}

/// Absolute destination of `node` under `course_dir`.
#[must_use]
pub fn destination(course_dir: &Path, node: &FileNode) -> PathBuf {
    course_dir.join(&node.path)
}
