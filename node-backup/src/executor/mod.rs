//! Backup and restore execution on one node.
//!
//! A backup locks the node, snapshots the selected tables, builds the
//! manifest, uploads everything it lists and clears the snapshot again. A
//! restore fetches the manifest of a tag and downloads the selected entries.
//! A commit log restore fetches archived commit logs for replay.

pub mod backup;
pub mod commitlog;
pub mod manifest;
pub mod restore;
pub mod snapshot;
pub mod stop;
pub mod tokens;

use std::path::{Path, PathBuf};

pub use backup::{BackupOperation, BackupPhase, BackupSummary};
pub use commitlog::{CommitLogRestoreOperation, CommitLogRestoreSummary};
pub use restore::{plan_downloads, RestoreOperation, RestorePlan, RestoreSummary};
pub use stop::{StopReason, StopSignal};

/// Staging area for generated files, relative to the shared directory
pub const STAGING_DIR: &str = "tmp/node-backup";

/// Restored schema files, below the staging directory
pub const SCHEMAS_DIR: &str = "schemas";

pub fn staging_directory(shared_path: &Path) -> PathBuf {
    shared_path.join(STAGING_DIR)
}
