//! Restore of archived commit logs.
//!
//! Archived logs are downloaded into the restore directory, then
//! `commitlog_archiving.properties` is pointed at that directory so the node
//! replays them, up to the requested point in time, on its next start.

use super::stop::StopSignal;
use crate::fs::GlobalLock;
use crate::request::CommitLogRestoreRequest;
use crate::storage::{ListedObject, StorageFactory};
use crate::transfer::{download_or_skip, Download, ProgressSink, TransferPolicy, TransferSummary};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Remote directory of archived commit logs
pub const COMMIT_LOG_DIR: &str = "commitlog";

pub const ARCHIVING_PROPERTIES: &str = "commitlog_archiving.properties";

const RESTORE_COMMAND: &str = "cp -f %from %to";

/// Format the node expects for `restore_point_in_time`, in UTC
const POINT_IN_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

#[derive(Debug, Clone, Serialize)]
pub struct CommitLogRestoreSummary {
    /// Logs found in storage
    pub archived_logs: usize,
    /// Logs within the time range
    pub restored_logs: usize,
    pub restore_directory: PathBuf,
    pub properties_file: PathBuf,
    pub transfer: TransferSummary,
}

/// Downloads for the archived logs in `listed` that fall into the request's
/// time range. Nested keys and names that are not plain file names are
/// skipped.
pub fn plan_commit_logs(listed: &[ListedObject], request: &CommitLogRestoreRequest) -> Vec<Download> {
    let restore_directory = request.restore_directory();
    let dir_prefix = format!("{}/", COMMIT_LOG_DIR);

    listed
        .iter()
        .filter_map(|object| {
            let name = object.key.strip_prefix(&dir_prefix)?;
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                debug!("Ignoring unexpected object {}", object.key);
                return None;
            }
            if !request.includes(object.last_modified) {
                return None;
            }
            Some(Download {
                key: object.key.clone(),
                target: restore_directory.join(name),
                size: object.size,
            })
        })
        .collect()
}

/// Point the archiving settings at `restore_directory`. Existing
/// `restore_*` lines, commented out or not, are replaced; every other line
/// is kept.
pub fn render_archiving_properties(
    existing: &str,
    restore_directory: &Path,
    point_in_time: Option<DateTime<Utc>>,
) -> String {
    let mut settings = vec![
        ("restore_command", RESTORE_COMMAND.to_string()),
        ("restore_directories", restore_directory.display().to_string()),
    ];
    if let Some(at) = point_in_time {
        settings.push(("restore_point_in_time", at.format(POINT_IN_TIME_FORMAT).to_string()));
    }

    let is_setting = |line: &str, key: &str| {
        let bare = line.trim_start().trim_start_matches('#').trim_start();
        bare.strip_prefix(key)
            .is_some_and(|rest| rest.trim_start().starts_with('='))
    };

    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !is_setting(line, "restore_point_in_time"))
        .map(str::to_string)
        .collect();

    for (key, value) in settings {
        let setting = format!("{}={}", key, value);
        match lines.iter_mut().find(|line| is_setting(line, key)) {
            Some(line) => *line = setting,
            None => lines.push(setting),
        }
    }

    let mut content = lines.join("\n");
    content.push('\n');
    content
}

fn write_archiving_properties(
    config_directory: &Path,
    restore_directory: &Path,
    point_in_time: Option<DateTime<Utc>>,
) -> Result<PathBuf> {
    let path = config_directory.join(ARCHIVING_PROPERTIES);
    let existing = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    std::fs::create_dir_all(config_directory)?;
    std::fs::write(
        &path,
        render_archiving_properties(&existing, restore_directory, point_in_time),
    )?;
    Ok(path)
}

pub struct CommitLogRestoreOperation {
    request: CommitLogRestoreRequest,
    storage: Arc<dyn StorageFactory>,
    stop: StopSignal,
}

impl CommitLogRestoreOperation {
    pub fn new(request: CommitLogRestoreRequest, storage: Arc<dyn StorageFactory>) -> Self {
        Self {
            request,
            storage,
            stop: StopSignal::new(),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub async fn run(&self, progress: Arc<dyn ProgressSink>) -> Result<CommitLogRestoreSummary> {
        self.stop.run(self.restore(progress)).await
    }

    async fn restore(&self, progress: Arc<dyn ProgressSink>) -> Result<CommitLogRestoreSummary> {
        let request = &self.request;
        let restore_directory = request.restore_directory();

        info!(
            location = %request.storage_location,
            directory = %restore_directory.display(),
            "Starting commit log restore"
        );

        let _lock = GlobalLock::acquire(&request.lock_file, request.wait_for_lock).await?;

        let restorer = self
            .storage
            .restorer(&request.storage_location, &request.storage_options)?;

        let listed = restorer.list(COMMIT_LOG_DIR).await?;
        let downloads = plan_commit_logs(&listed, request);
        if downloads.is_empty() {
            return Err(BackupError::NoCommitLogs(
                request.storage_location.child(COMMIT_LOG_DIR).to_string(),
            ));
        }

        let restored_logs = downloads.len();
        tokio::fs::create_dir_all(&restore_directory).await?;
        let policy = TransferPolicy::from(&request.transfer);
        let transfer = download_or_skip(restorer, downloads, &policy, progress).await?;

        let config_directory = request.config_directory.clone();
        let target = restore_directory.clone();
        let point_in_time = request.timestamp_end;
        let properties_file = tokio::task::spawn_blocking(move || {
            write_archiving_properties(&config_directory, &target, point_in_time)
        })
        .await??;

        info!(
            restored = restored_logs,
            archived = listed.len(),
            properties = %properties_file.display(),
            "Commit log restore finished"
        );

        Ok(CommitLogRestoreSummary {
            archived_logs: listed.len(),
            restored_logs,
            restore_directory,
            properties_file,
            transfer,
        })
    }
}
