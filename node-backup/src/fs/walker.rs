//! Directory traversal for snapshot discovery.
//!
//! Snapshots live at `<data root>/<keyspace>/<table>/snapshots/<tag>`; the
//! walker finds those directories and lists the files inside them in a
//! stable order.

use crate::utils::errors::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Name of the directory holding per-tag snapshot directories
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Depth of `<keyspace>/<table>/snapshots/<tag>` below the data root
const SNAPSHOT_DEPTH: usize = 4;

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File names containing any of these are skipped
    pub exclude_patterns: Vec<String>,
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
        })
    }

    /// Relative path joined with `/`, independent of the platform separator
    pub fn relative_key(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Walk a directory tree and collect all regular files, sorted by path.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;

        if should_exclude(&entry, &options.exclude_patterns) {
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

/// A `<keyspace>/<table>/snapshots/<tag>` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceTableSnapshot {
    pub keyspace: String,
    pub table: String,
    pub snapshot_directory: PathBuf,
}

impl KeyspaceTableSnapshot {
    /// Derive keyspace and table from the two directories above `snapshots/`.
    pub fn from_snapshot_directory(snapshot_directory: &Path) -> Option<Self> {
        let table_directory = snapshot_directory.parent()?.parent()?;
        let table = table_directory.file_name()?.to_string_lossy().into_owned();
        let keyspace = table_directory
            .parent()?
            .file_name()?
            .to_string_lossy()
            .into_owned();

        Some(Self {
            keyspace,
            table,
            snapshot_directory: snapshot_directory.to_path_buf(),
        })
    }

    pub fn tag(&self) -> String {
        self.snapshot_directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Find every snapshot directory under `data_root`, grouped by tag.
pub fn find_snapshot_directories(
    data_root: &Path,
) -> Result<BTreeMap<String, Vec<KeyspaceTableSnapshot>>> {
    if !data_root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data directory {} does not exist", data_root.display()),
        )
        .into());
    }

    let mut snapshots: BTreeMap<String, Vec<KeyspaceTableSnapshot>> = BTreeMap::new();

    let walker = WalkDir::new(data_root)
        .min_depth(SNAPSHOT_DEPTH)
        .max_depth(SNAPSHOT_DEPTH)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;

        if !entry.file_type().is_dir() {
            continue;
        }

        let under_snapshots = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|name| name == SNAPSHOTS_DIR);
        if !under_snapshots {
            continue;
        }

        if let Some(snapshot) = KeyspaceTableSnapshot::from_snapshot_directory(entry.path()) {
            snapshots.entry(snapshot.tag()).or_default().push(snapshot);
        }
    }

    Ok(snapshots)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_is_sorted_and_recursive() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("idx"))?;
        fs::write(temp_dir.path().join("b.db"), b"b")?;
        fs::write(temp_dir.path().join("a.db"), b"aa")?;
        fs::write(temp_dir.path().join("idx/c.db"), b"ccc")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let keys: Vec<String> = files.iter().map(|f| f.relative_key()).collect();
        assert_eq!(keys, vec!["a.db", "b.db", "idx/c.db"]);
        assert_eq!(files[0].size, 2);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("keep.db"), b"keep")?;
        fs::write(temp_dir.path().join("schema.cql"), b"exclude")?;

        let options = WalkOptions {
            exclude_patterns: vec!["schema.cql".to_string()],
            ..WalkOptions::default()
        };
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_key(), "keep.db");

        Ok(())
    }

    #[test]
    fn test_find_snapshot_directories_groups_by_tag() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        fs::create_dir_all(root.join("ks1/t1/snapshots/tag1"))?;
        fs::create_dir_all(root.join("ks1/t2/snapshots/tag1"))?;
        fs::create_dir_all(root.join("ks2/t1/snapshots/tag2"))?;
        // Not under a snapshots directory
        fs::create_dir_all(root.join("ks1/t1/backups/tag1"))?;

        let snapshots = find_snapshot_directories(root)?;
        assert_eq!(snapshots.len(), 2);

        let tag1 = &snapshots["tag1"];
        assert_eq!(tag1.len(), 2);
        assert_eq!(tag1[0].keyspace, "ks1");
        assert_eq!(tag1[0].table, "t1");
        assert_eq!(tag1[1].table, "t2");

        let tag2 = &snapshots["tag2"];
        assert_eq!(tag2[0].keyspace, "ks2");

        Ok(())
    }

    #[test]
    fn test_missing_data_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(find_snapshot_directories(&temp_dir.path().join("missing")).is_err());
    }
}
