//! Listing entries, classified once when they arrive.
//!
//! Canvas returns folders, files and modules as loosely-typed JSON. Each raw
//! value is turned into an [`Entry`] here so the rest of the pipeline works on
//! a closed set of variants.

use serde::Deserialize;
use serde_json::Value;

/// A classified listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A folder (or a module standing in for one).
    Folder(FolderEntry),
    /// A downloadable file.
    File(FileEntry),
}

/// A folder as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub id: u64,
    pub name: String,
    pub parent_id: Option<u64>,
    pub position: Option<i64>,
    /// The course's top-level folder ("course files"); its contents belong
    /// directly in the course directory.
    pub course_root: bool,
}

/// A file as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: u64,
    pub name: String,
    pub folder_id: Option<u64>,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    /// Absent for locked files.
    pub download_url: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFolder {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    parent_folder_id: Option<u64>,
    #[serde(default)]
    position: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    id: u64,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    folder_id: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, rename = "content-type")]
    content_type: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// A module with its inlined items (`include[]=items`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleEntry {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub items: Option<Vec<ModuleItem>>,
}

/// One item inside a module.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleItem {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content_id: Option<u64>,
}

impl Entry {
    /// Classifies a raw folder or file object by the fields it carries.
    ///
    /// Returns `None` for values that are neither (the caller records a
    /// warning and moves on).
    #[must_use]
    pub fn classify(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let is_file = object.contains_key("url")
            || object.contains_key("display_name")
            || object.contains_key("filename");
        let is_folder = object.contains_key("parent_folder_id")
            || object.contains_key("full_name")
            || object.contains_key("folders_count");

        if is_file {
            let raw: RawFile = serde_json::from_value(value.clone()).ok()?;
            let name = raw
                .display_name
                .or(raw.filename)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| raw.id.to_string());
            return Some(Self::File(FileEntry {
                id: raw.id,
                name,
                folder_id: raw.folder_id,
                size: raw.size,
                content_type: raw.content_type,
                download_url: raw.url.filter(|u| !u.is_empty()),
                updated_at: raw.updated_at,
            }));
        }

        if is_folder {
            let raw: RawFolder = serde_json::from_value(value.clone()).ok()?;
            let course_root = raw.parent_folder_id.is_none()
                && object.contains_key("parent_folder_id");
            let name = raw
                .name
                .or_else(|| {
                    raw.full_name
                        .as_deref()
                        .and_then(|full| full.rsplit('/').next())
                        .map(str::to_string)
                })
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("folder-{}", raw.id));
            return Some(Self::Folder(FolderEntry {
                id: raw.id,
                name,
                parent_id: raw.parent_folder_id,
                position: raw.position,
                course_root,
            }));
        }

        None
    }

    /// The entry's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Folder(folder) => folder.id,
            Self::File(file) => file.id,
        }
    }
}

impl ModuleEntry {
    /// Parses a raw module object.
    #[must_use]
    pub fn parse(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// The folder this module becomes: a direct child of the course root.
    #[must_use]
    pub fn to_folder(&self) -> FolderEntry {
        FolderEntry {
            id: self.id,
            name: self
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("module-{}", self.id)),
            parent_id: None,
            position: self.position,
            course_root: false,
        }
    }

    /// Ids of the files this module links to, in module order.
    #[must_use]
    pub fn file_ids(&self) -> Vec<u64> {
        self.items
            .iter()
            .flatten()
            .filter(|item| item.kind.as_deref() == Some("File"))
            .filter_map(|item| item.content_id)
            .collect()
    }
}
