//! Keyspace/table selection.
//!
//! A selector is written either as bare keyspaces (`ks1,ks2`) or as
//! dot-qualified tables (`ks1.t1,ks2.t2`). The two forms cannot be mixed.
//! An empty selector means every keyspace.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Keyspace excluded from restores unless explicitly requested.
pub const SYSTEM_KEYSPACE: &str = "system";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatabaseEntities {
    #[default]
    All,
    Keyspaces(BTreeSet<String>),
    Tables(BTreeSet<(String, String)>),
}

impl DatabaseEntities {
    /// Parse a selector string.
    pub fn parse(raw: &str) -> Result<Self> {
        let stripped: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

        if stripped.is_empty() {
            return Ok(DatabaseEntities::All);
        }

        let format_error = |reason: String| BackupError::SelectorFormat {
            input: raw.to_string(),
            reason,
        };

        if stripped.contains('.') {
            let mut tables = BTreeSet::new();
            for token in stripped.split(',') {
                match token.split_once('.') {
                    Some((keyspace, table))
                        if !keyspace.is_empty() && !table.is_empty() && !table.contains('.') =>
                    {
                        tables.insert((keyspace.to_string(), table.to_string()));
                    }
                    _ => return Err(format_error(format!("not in format 'ks.table': '{}'", token))),
                }
            }
            return Ok(DatabaseEntities::Tables(tables));
        }

        let mut keyspaces = BTreeSet::new();
        for token in stripped.split(',') {
            if token.is_empty() {
                return Err(format_error("empty keyspace name".to_string()));
            }
            keyspaces.insert(token.to_string());
        }
        Ok(DatabaseEntities::Keyspaces(keyspaces))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, DatabaseEntities::All)
    }

    /// Whether data of `table` in `keyspace` is in scope. `table` may be an
    /// on-disk table directory name carrying an id suffix.
    pub fn includes_table(&self, keyspace: &str, table: &str) -> bool {
        match self {
            DatabaseEntities::All => true,
            DatabaseEntities::Keyspaces(keyspaces) => keyspaces.contains(keyspace),
            DatabaseEntities::Tables(tables) => {
                let logical = logical_table_name(table);
                tables
                    .iter()
                    .any(|(ks, t)| ks == keyspace && (t == table || t == logical))
            }
        }
    }

    /// Arguments for a snapshot request; empty means the whole node.
    pub fn snapshot_targets(&self) -> Vec<String> {
        match self {
            DatabaseEntities::All => Vec::new(),
            DatabaseEntities::Keyspaces(keyspaces) => keyspaces.iter().cloned().collect(),
            DatabaseEntities::Tables(tables) => tables
                .iter()
                .map(|(ks, t)| format!("{}.{}", ks, t))
                .collect(),
        }
    }
}

/// Strip the `-<32 hex>` table id suffix the database appends to table
/// directory names.
pub fn logical_table_name(dir_name: &str) -> &str {
    match dir_name.rsplit_once('-') {
        Some((name, id)) if id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()) => name,
        _ => dir_name,
    }
}

impl fmt::Display for DatabaseEntities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snapshot_targets().join(","))
    }
}

impl FromStr for DatabaseEntities {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        DatabaseEntities::parse(s)
    }
}

impl TryFrom<String> for DatabaseEntities {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        DatabaseEntities::parse(&value)
    }
}

impl From<DatabaseEntities> for String {
    fn from(entities: DatabaseEntities) -> Self {
        entities.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_means_all() {
        assert_eq!(DatabaseEntities::parse("").unwrap(), DatabaseEntities::All);
        assert_eq!(DatabaseEntities::parse("  \t ").unwrap(), DatabaseEntities::All);
        assert!(DatabaseEntities::parse("").unwrap().snapshot_targets().is_empty());
    }

    #[test]
    fn test_keyspaces() {
        let entities = DatabaseEntities::parse("ks1, ks2").unwrap();
        match &entities {
            DatabaseEntities::Keyspaces(ks) => {
                assert_eq!(ks.len(), 2);
                assert!(ks.contains("ks1") && ks.contains("ks2"));
            }
            other => panic!("unexpected selector {:?}", other),
        }
        assert!(entities.includes_table("ks1", "anything"));
        assert!(!entities.includes_table("ks3", "t1"));
    }

    #[test]
    fn test_tables_round_trip() {
        let entities = DatabaseEntities::parse("ks1.t1,ks2.t2").unwrap();
        let expected: BTreeSet<(String, String)> = [("ks1", "t1"), ("ks2", "t2")]
            .iter()
            .map(|(k, t)| (k.to_string(), t.to_string()))
            .collect();
        assert_eq!(entities, DatabaseEntities::Tables(expected));
        assert_eq!(entities.to_string(), "ks1.t1,ks2.t2");
        assert_eq!(DatabaseEntities::parse(&entities.to_string()).unwrap(), entities);
    }

    #[test]
    fn test_mixed_format_is_rejected() {
        let err = DatabaseEntities::parse("ks1.t1,ks2").unwrap_err();
        assert!(matches!(err, BackupError::SelectorFormat { .. }));

        let err = DatabaseEntities::parse("ks2,ks1.t1").unwrap_err();
        assert!(matches!(err, BackupError::SelectorFormat { .. }));
    }

    #[test]
    fn test_malformed_tokens_are_rejected() {
        assert!(DatabaseEntities::parse("ks1.t1.x").is_err());
        assert!(DatabaseEntities::parse(".t1").is_err());
        assert!(DatabaseEntities::parse("ks1.").is_err());
        assert!(DatabaseEntities::parse("ks1,,ks2").is_err());
    }

    #[test]
    fn test_table_directory_with_id_suffix() {
        let entities = DatabaseEntities::parse("ks1.t1").unwrap();
        assert!(entities.includes_table("ks1", "t1"));
        assert!(entities.includes_table("ks1", "t1-5a1c395e8b6e11eabc550242ac130003"));
        assert!(!entities.includes_table("ks1", "t10"));
        assert!(!entities.includes_table("ks2", "t1"));
    }

    #[test]
    fn test_logical_table_name() {
        assert_eq!(logical_table_name("t1-5a1c395e8b6e11eabc550242ac130003"), "t1");
        assert_eq!(logical_table_name("my-table"), "my-table");
        assert_eq!(logical_table_name("t1"), "t1");
    }

    #[test]
    fn test_serde_as_string() {
        let entities = DatabaseEntities::parse("ks1,ks2").unwrap();
        let json = serde_json::to_string(&entities).unwrap();
        assert_eq!(json, "\"ks1,ks2\"");

        let back: DatabaseEntities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entities);

        assert!(serde_json::from_str::<DatabaseEntities>("\"ks1.t1,ks2\"").is_err());
    }
}
