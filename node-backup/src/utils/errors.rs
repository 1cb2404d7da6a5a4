//! Error types for backup and restore operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Lock {0} is held by another process")]
    LockUnavailable(PathBuf),

    #[error("Invalid entities '{input}': {reason}")]
    SelectorFormat { input: String, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("No Data.db files found in manifest for snapshot '{0}', aborting backup")]
    NoDataFiles(String),

    #[error("No commit logs archived at {0} match the requested time range")]
    NoCommitLogs(String),

    #[error("Transfer of {key} failed: {reason}")]
    Transfer { key: String, reason: String },

    #[error("Cluster control error: {0}")]
    Cluster(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown storage provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid manifest: {0}")]
    ManifestFormat(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    pub fn transfer(key: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::Transfer {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<object_store::Error> for BackupError {
    fn from(e: object_store::Error) -> Self {
        BackupError::Storage(e.to_string())
    }
}

impl From<walkdir::Error> for BackupError {
    fn from(e: walkdir::Error) -> Self {
        BackupError::Io(e.into())
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(e: config::ConfigError) -> Self {
        BackupError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            BackupError::Cancelled
        } else {
            BackupError::Io(std::io::Error::other(format!("worker task panicked: {}", e)))
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BackupError::NoDataFiles("tag1".to_string());
        assert_eq!(
            err.to_string(),
            "No Data.db files found in manifest for snapshot 'tag1', aborting backup"
        );

        let err = BackupError::transfer("data/ks1/t1/a-Data.db", "connection reset");
        assert!(err.to_string().contains("data/ks1/t1/a-Data.db"));

        let err = BackupError::Timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "Operation timed out after 90s");
    }
}
