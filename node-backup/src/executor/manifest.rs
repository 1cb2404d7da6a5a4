//! Manifest model and the manifest builder.
//!
//! A manifest is the ordered list of everything one backup attempt transfers.
//! It is written as plain text, one `<size> <objectKey>` line per entry, and
//! uploaded under `manifests/<tag>` after the content it lists.

use crate::entities::DatabaseEntities;
use crate::fs::walker::{find_snapshot_directories, walk_directory, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Marker present in the name of every live table data file
pub const DATA_FILE_MARKER: &str = "-Data.db";

/// Schema file the database writes into each snapshot directory
pub const SCHEMA_FILE: &str = "schema.cql";

/// Remote directory holding manifest files
pub const MANIFESTS_DIR: &str = "manifests";

/// Remote directory holding per-table data
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    File,
    ManifestFile,
}

/// One unit of transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Key relative to the storage location prefix, always `/`-separated
    pub object_key: String,
    /// Absent for entries read back from a remote manifest
    pub local_file: Option<PathBuf>,
    pub size: u64,
    pub entry_type: EntryType,
}

impl ManifestEntry {
    /// Entry for a file on this node; the size is read from disk.
    pub fn local(
        object_key: impl Into<String>,
        local_file: impl Into<PathBuf>,
        entry_type: EntryType,
    ) -> Result<Self> {
        let local_file = local_file.into();
        let size = std::fs::metadata(&local_file)?.len();

        Ok(Self {
            object_key: object_key.into(),
            local_file: Some(local_file),
            size,
            entry_type,
        })
    }

    pub fn remote(object_key: impl Into<String>, size: u64) -> Self {
        let object_key = object_key.into();
        let entry_type = if object_key.starts_with(&format!("{}/", MANIFESTS_DIR)) {
            EntryType::ManifestFile
        } else {
            EntryType::File
        };

        Self {
            object_key,
            local_file: None,
            size,
            entry_type,
        }
    }

    pub fn is_data_file(&self) -> bool {
        self.local_file
            .as_ref()
            .and_then(|p| p.file_name())
            .is_some_and(|name| name.to_string_lossy().contains(DATA_FILE_MARKER))
    }
}

/// Insertion-ordered entries with unique object keys.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    keys: HashSet<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ManifestEntry) -> Result<()> {
        if !self.keys.insert(entry.object_key.clone()) {
            return Err(BackupError::ManifestFormat(format!(
                "duplicate object key {}",
                entry.object_key
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn has_data_files(&self) -> bool {
        self.entries.iter().any(ManifestEntry::is_data_file)
    }

    /// Render in the manifest file format: `<size> <objectKey>\n` per entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("{} {}\n", entry.size, entry.object_key));
        }
        out
    }

    /// Parse a manifest file fetched from storage.
    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest = Manifest::new();

        for (line_no, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }

            let (size, key) = line.split_once(' ').ok_or_else(|| {
                BackupError::ManifestFormat(format!("line {}: expected '<size> <key>'", line_no + 1))
            })?;
            let size: u64 = size.parse().map_err(|_| {
                BackupError::ManifestFormat(format!("line {}: invalid size '{}'", line_no + 1, size))
            })?;
            if key.is_empty() {
                return Err(BackupError::ManifestFormat(format!(
                    "line {}: empty object key",
                    line_no + 1
                )));
            }

            manifest.push(ManifestEntry::remote(key, size))?;
        }

        Ok(manifest)
    }
}

impl IntoIterator for Manifest {
    type Item = ManifestEntry;
    type IntoIter = std::vec::IntoIter<ManifestEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Build the manifest of snapshot `tag` from the data root
/// (`<data root>/<keyspace>/<table>/snapshots/<tag>`).
///
/// Fails with [`BackupError::NoDataFiles`] when the selected snapshot
/// directories contain no `-Data.db` file.
pub fn build_manifest(data_root: &Path, entities: &DatabaseEntities, tag: &str) -> Result<Manifest> {
    let snapshots = find_snapshot_directories(data_root)?;
    let mut manifest = Manifest::new();

    let walk_options = WalkOptions {
        exclude_patterns: vec![SCHEMA_FILE.to_string()],
        ..WalkOptions::default()
    };

    for snapshot in snapshots.get(tag).into_iter().flatten() {
        if !entities.includes_table(&snapshot.keyspace, &snapshot.table) {
            continue;
        }

        let table_key = format!("{}/{}/{}", DATA_DIR, snapshot.keyspace, snapshot.table);

        for file in walk_directory(&snapshot.snapshot_directory, &walk_options)? {
            let key = format!("{}/{}", table_key, file.relative_key());
            manifest.push(ManifestEntry {
                object_key: key,
                local_file: Some(file.path),
                size: file.size,
                entry_type: EntryType::File,
            })?;
        }

        let schema_path = snapshot.snapshot_directory.join(SCHEMA_FILE);
        if schema_path.is_file() {
            manifest.push(ManifestEntry::local(
                format!("{}/{}-{}", table_key, tag, SCHEMA_FILE),
                schema_path,
                EntryType::File,
            )?)?;
        }
    }

    info!("{} files in manifest for snapshot \"{}\"", manifest.len(), tag);

    if !manifest.has_data_files() {
        return Err(BackupError::NoDataFiles(tag.to_string()));
    }

    Ok(manifest)
}

/// Create an empty manifest file at `<dir>/<tag>`, replacing a stale one.
pub fn prepare_manifest_file(dir: &Path, tag: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(tag);

    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    std::fs::File::create(&path)?;

    Ok(path)
}

/// Write `manifest` to `path` and return the entry describing the manifest
/// file itself, keyed `manifests/<file name>`.
pub fn save_manifest(manifest: &Manifest, path: &Path) -> Result<ManifestEntry> {
    if let Err(e) = std::fs::write(path, manifest.render()) {
        error!("Unable to write manifest entries into {}: {}", path.display(), e);
        if let Err(remove_err) = std::fs::remove_file(path) {
            error!("Unable to delete manifest file {}: {}", path.display(), remove_err);
        }
        return Err(e.into());
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::ManifestFormat(format!("no file name in {}", path.display())))?;

    ManifestEntry::local(
        format!("{}/{}", MANIFESTS_DIR, file_name),
        path,
        EntryType::ManifestFile,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_snapshot(root: &Path, ks: &str, table: &str, tag: &str, files: &[(&str, &[u8])]) {
        let dir = root.join(ks).join(table).join("snapshots").join(tag);
        fs::create_dir_all(&dir).unwrap();
        for (name, content) in files {
            fs::write(dir.join(name), content).unwrap();
        }
    }

    fn keys(manifest: &Manifest) -> Vec<&str> {
        manifest.entries().iter().map(|e| e.object_key.as_str()).collect()
    }

    #[test]
    fn test_single_table_with_schema() {
        let temp_dir = TempDir::new().unwrap();
        write_snapshot(
            temp_dir.path(),
            "ks1",
            "t1",
            "tag1",
            &[
                ("t1-big-Data.db", b"data"),
                ("t1-big-Index.db", b"index"),
                ("schema.cql", b"CREATE TABLE ks1.t1 (id int PRIMARY KEY);"),
            ],
        );

        let manifest = build_manifest(temp_dir.path(), &DatabaseEntities::All, "tag1").unwrap();
        assert_eq!(
            keys(&manifest),
            vec![
                "data/ks1/t1/t1-big-Data.db",
                "data/ks1/t1/t1-big-Index.db",
                "data/ks1/t1/tag1-schema.cql",
            ]
        );
        assert_eq!(manifest.entries()[0].size, 4);
        assert!(manifest.entries().iter().all(|e| e.entry_type == EntryType::File));
    }

    #[test]
    fn test_only_requested_tag_is_included() {
        let temp_dir = TempDir::new().unwrap();
        write_snapshot(temp_dir.path(), "ks1", "t1", "tag1", &[("a-Data.db", b"1")]);
        write_snapshot(temp_dir.path(), "ks1", "t1", "tag2", &[("b-Data.db", b"2")]);

        let manifest = build_manifest(temp_dir.path(), &DatabaseEntities::All, "tag2").unwrap();
        assert_eq!(keys(&manifest), vec!["data/ks1/t1/b-Data.db"]);
    }

    #[test]
    fn test_entities_filter_tables() {
        let temp_dir = TempDir::new().unwrap();
        write_snapshot(temp_dir.path(), "ks1", "t1", "tag1", &[("a-Data.db", b"1")]);
        write_snapshot(temp_dir.path(), "ks1", "t2", "tag1", &[("b-Data.db", b"2")]);
        write_snapshot(temp_dir.path(), "ks2", "t1", "tag1", &[("c-Data.db", b"3")]);

        let entities = DatabaseEntities::parse("ks1.t2").unwrap();
        let manifest = build_manifest(temp_dir.path(), &entities, "tag1").unwrap();
        assert_eq!(keys(&manifest), vec!["data/ks1/t2/b-Data.db"]);

        let entities = DatabaseEntities::parse("ks1").unwrap();
        let manifest = build_manifest(temp_dir.path(), &entities, "tag1").unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn test_no_data_files_aborts() {
        let temp_dir = TempDir::new().unwrap();
        write_snapshot(
            temp_dir.path(),
            "ks1",
            "t1",
            "tag1",
            &[("t1-big-Index.db", b"index"), ("t1-big-Summary.db", b"summary")],
        );

        let err = build_manifest(temp_dir.path(), &DatabaseEntities::All, "tag1").unwrap_err();
        assert!(matches!(err, BackupError::NoDataFiles(tag) if tag == "tag1"));

        let err = build_manifest(temp_dir.path(), &DatabaseEntities::All, "missing").unwrap_err();
        assert!(matches!(err, BackupError::NoDataFiles(_)));
    }

    #[test]
    fn test_build_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        write_snapshot(temp_dir.path(), "ks2", "t9", "tag1", &[("z-Data.db", b"1")]);
        write_snapshot(
            temp_dir.path(),
            "ks1",
            "t1",
            "tag1",
            &[("b-Data.db", b"1"), ("a-Data.db", b"2"), ("c-Index.db", b"3")],
        );

        let first = build_manifest(temp_dir.path(), &DatabaseEntities::All, "tag1").unwrap();
        let second = build_manifest(temp_dir.path(), &DatabaseEntities::All, "tag1").unwrap();
        assert_eq!(first.render(), second.render());
        assert_eq!(
            keys(&first),
            vec![
                "data/ks1/t1/a-Data.db",
                "data/ks1/t1/b-Data.db",
                "data/ks1/t1/c-Index.db",
                "data/ks2/t9/z-Data.db",
            ]
        );
    }

    #[test]
    fn test_render_and_parse() {
        let mut manifest = Manifest::new();
        manifest.push(ManifestEntry::remote("data/ks1/t1/a-Data.db", 10)).unwrap();
        manifest.push(ManifestEntry::remote("tokens/tag1-tokens.yaml", 42)).unwrap();

        let text = manifest.render();
        assert_eq!(text, "10 data/ks1/t1/a-Data.db\n42 tokens/tag1-tokens.yaml\n");

        let parsed = Manifest::parse(&text).unwrap();
        assert_eq!(parsed.entries(), manifest.entries());
        assert!(Manifest::parse("abc data/x").is_err());
        assert!(Manifest::parse("12").is_err());
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        let mut manifest = Manifest::new();
        manifest.push(ManifestEntry::remote("data/a", 1)).unwrap();
        assert!(manifest.push(ManifestEntry::remote("data/a", 2)).is_err());
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_manifest_file_replaces_stale_copy() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("manifests");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tag1"), "stale content that is long").unwrap();

        let path = prepare_manifest_file(&dir, "tag1").unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        let mut manifest = Manifest::new();
        manifest.push(ManifestEntry::remote("data/ks1/t1/a-Data.db", 3)).unwrap();

        let entry = save_manifest(&manifest, &path).unwrap();
        assert_eq!(entry.object_key, "manifests/tag1");
        assert_eq!(entry.entry_type, EntryType::ManifestFile);
        assert_eq!(entry.local_file.as_deref(), Some(path.as_path()));
        assert_eq!(fs::read_to_string(&path).unwrap(), "3 data/ks1/t1/a-Data.db\n");
        assert_eq!(entry.size, 24);
    }
}
