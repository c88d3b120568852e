//! Artifact location and directory inventory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::ArtifactsConfig;

/// Manifest key of the inventoried root directory.
pub const ROOT_KEY: &str = "root";

/// One child of an inventoried directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub is_directory: bool,
    /// File size; `None` for directories.
    pub size_bytes: Option<u64>,
}

/// Directory inventory: relative directory path -> sorted immediate children.
///
/// The root is keyed [`ROOT_KEY`], subdirectories by their `/`-separated path
/// relative to the root. Derived from the tree, never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Manifest {
    directories: BTreeMap<String, Vec<ManifestEntry>>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    /// Number of directories inventoried (root included).
    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }

    /// Children of one directory.
    pub fn entries(&self, key: &str) -> Option<&[ManifestEntry]> {
        self.directories.get(key).map(Vec::as_slice)
    }

    pub fn directories(&self) -> impl Iterator<Item = (&str, &[ManifestEntry])> {
        self.directories
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Every file as `relative/path -> size`.
    pub fn files(&self) -> BTreeMap<String, u64> {
        let mut files = BTreeMap::new();
        for (key, entries) in &self.directories {
            for entry in entries.iter().filter(|e| !e.is_directory) {
                files.insert(child_path(key, &entry.name), entry.size_bytes.unwrap_or(0));
            }
        }
        files
    }

    /// Total bytes across all files.
    pub fn total_bytes(&self) -> u64 {
        self.files().values().sum()
    }
}

fn child_path(dir_key: &str, name: &str) -> String {
    if dir_key == ROOT_KEY {
        name.to_string()
    } else {
        format!("{dir_key}/{name}")
    }
}

fn dir_key(relative: &Path) -> String {
    if relative.as_os_str().is_empty() {
        return ROOT_KEY.to_string();
    }
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// First candidate that exists on disk, in priority order.
///
/// Stops at the first hit. A candidate that cannot be stat'ed (missing,
/// permission denied, dead mount) counts as absent.
pub fn locate<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|candidate| -> &Path { candidate.as_ref() })
        .find(|path| std::fs::metadata(path).is_ok())
        .map(Path::to_path_buf)
}

/// Recursively inventory `root`.
///
/// A missing root yields an empty manifest. Symbolic links are listed but
/// never followed.
pub fn inventory(root: &Path) -> Manifest {
    let mut manifest = Manifest::default();
    if !root.is_dir() {
        return manifest;
    }

    let walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };

        let is_directory = entry.file_type().is_dir();
        if is_directory {
            manifest.directories.entry(dir_key(relative)).or_default();
        }
        if entry.depth() == 0 {
            continue;
        }

        let parent = relative.parent().map(dir_key).unwrap_or_else(|| ROOT_KEY.to_string());
        let size_bytes = if is_directory {
            None
        } else {
            entry.metadata().ok().map(|m| m.len())
        };
        manifest.directories.entry(parent).or_default().push(ManifestEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory,
            size_bytes,
        });
    }
    manifest
}

/// Sorted names directly inside `dir`; empty when the directory is missing.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = read
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// A download name must be a single plain path component.
pub fn is_valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

/// Download search order: exact name next to the canonical archive, the
/// canonical archive itself, then the compiled output directory.
///
/// Returns `None` for names that are not a single path component.
pub fn download_candidates(artifacts: &ArtifactsConfig, name: &str) -> Option<Vec<PathBuf>> {
    if !is_valid_artifact_name(name) {
        return None;
    }
    Some(vec![
        artifacts.archive_dir().join(name),
        artifacts.archive_path.clone(),
        artifacts.compiled_output_dir.join(name),
    ])
}
