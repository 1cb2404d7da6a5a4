//! Restore of one node from a published backup.

use super::manifest::{EntryType, Manifest, DATA_DIR, MANIFESTS_DIR, SCHEMA_FILE};
use super::tokens::{parse_token_file, update_cassandra_yaml, TOKENS_DIR};
use super::stop::StopSignal;
use super::{staging_directory, SCHEMAS_DIR};
use crate::entities::SYSTEM_KEYSPACE;
use crate::fs::GlobalLock;
use crate::request::RestoreRequest;
use crate::storage::StorageFactory;
use crate::transfer::{download_or_skip, Download, ProgressSink, TransferPolicy, TransferSummary};
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a restore fetches and where it puts it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePlan {
    pub downloads: Vec<Download>,
    /// Local path of the token file, when it is part of the plan
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub snapshot_tag: String,
    pub manifest_entries: usize,
    pub planned_entries: usize,
    pub transfer: TransferSummary,
    pub updated_config: Option<PathBuf>,
}

/// Map manifest entries to local targets.
///
/// Data files go below the database directory under their object key;
/// schema and token files go to the staging directory. Entries outside the
/// entity selection, and the `system` keyspace unless requested, are left out.
/// The token file is only fetched when the node configuration is updated.
pub fn plan_downloads(manifest: &Manifest, request: &RestoreRequest) -> Result<RestorePlan> {
    let staging = staging_directory(&request.shared_path);
    let mut plan = RestorePlan::default();

    for entry in manifest.entries() {
        if entry.entry_type == EntryType::ManifestFile {
            continue;
        }

        let key = entry.object_key.as_str();
        check_key(key)?;

        if let Some(name) = key.strip_prefix(&format!("{}/", TOKENS_DIR)) {
            if request.update_config {
                let target = staging.join(TOKENS_DIR).join(name);
                plan.token_file = Some(target.clone());
                plan.downloads.push(Download {
                    key: key.to_string(),
                    target,
                    size: entry.size,
                });
            }
            continue;
        }

        let Some(table_relative) = key.strip_prefix(&format!("{}/", DATA_DIR)) else {
            warn!("Ignoring unexpected manifest entry {}", key);
            continue;
        };

        let mut parts = table_relative.splitn(3, '/');
        let (keyspace, table, file) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ks), Some(t), Some(f)) if !ks.is_empty() && !t.is_empty() && !f.is_empty() => {
                (ks, t, f)
            }
            _ => {
                return Err(BackupError::ManifestFormat(format!(
                    "data entry {} is not in the form data/<keyspace>/<table>/<file>",
                    key
                )))
            }
        };

        if keyspace == SYSTEM_KEYSPACE && !request.restore_system_keyspace {
            debug!("Skipping system keyspace entry {}", key);
            continue;
        }
        if !request.entities.includes_table(keyspace, table) {
            continue;
        }

        let target = if file.ends_with(&format!("-{}", SCHEMA_FILE)) {
            staging.join(SCHEMAS_DIR).join(keyspace).join(table).join(file)
        } else {
            request.cassandra_directory.join(key)
        };

        plan.downloads.push(Download {
            key: key.to_string(),
            target,
            size: entry.size,
        });
    }

    Ok(plan)
}

/// Object keys come from storage; they must not point outside the targets.
fn check_key(key: &str) -> Result<()> {
    if key.starts_with('/') || key.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(BackupError::ManifestFormat(format!("unsafe object key {}", key)));
    }
    Ok(())
}

pub struct RestoreOperation {
    request: RestoreRequest,
    storage: Arc<dyn StorageFactory>,
    stop: StopSignal,
}

impl RestoreOperation {
    pub fn new(request: RestoreRequest, storage: Arc<dyn StorageFactory>) -> Self {
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

    /// Downloads in flight when the stop signal is raised are abandoned;
    /// their temporary files never replace a target.
    pub async fn run(&self, progress: Arc<dyn ProgressSink>) -> Result<RestoreSummary> {
        self.stop.run(self.restore(progress)).await
    }

    async fn restore(&self, progress: Arc<dyn ProgressSink>) -> Result<RestoreSummary> {
        let request = &self.request;

        info!(
            snapshot_tag = %request.snapshot_tag,
            location = %request.storage_location,
            entities = %request.entities,
            "Starting restore"
        );

        let _lock = GlobalLock::acquire(&request.lock_file, request.wait_for_lock).await?;

        let restorer = self
            .storage
            .restorer(&request.storage_location, &request.storage_options)?;

        let manifest_key = format!("{}/{}", MANIFESTS_DIR, request.snapshot_tag);
        let manifest = Manifest::parse(&restorer.download_text(&manifest_key).await?)?;
        info!("Fetched manifest {} with {} entries", manifest_key, manifest.len());

        let plan = plan_downloads(&manifest, request)?;
        if request.update_config && plan.token_file.is_none() {
            return Err(BackupError::ManifestFormat(format!(
                "backup {} has no token file, cannot update the node configuration",
                request.snapshot_tag
            )));
        }

        let planned_entries = plan.downloads.len();
        let policy = TransferPolicy::from(&request.transfer);
        let transfer = download_or_skip(restorer, plan.downloads, &policy, progress).await?;

        let updated_config = match plan.token_file {
            Some(token_file) if request.update_config => {
                Some(apply_tokens(&token_file, &request.config_directory).await?)
            }
            _ => None,
        };

        info!(
            snapshot_tag = %request.snapshot_tag,
            restored = transfer.transferred_entries,
            present = transfer.freshened_entries,
            "Restore finished"
        );

        Ok(RestoreSummary {
            snapshot_tag: request.snapshot_tag.clone(),
            manifest_entries: manifest.len(),
            planned_entries,
            transfer,
            updated_config,
        })
    }
}

async fn apply_tokens(token_file: &Path, config_directory: &Path) -> Result<PathBuf> {
    let text = tokio::fs::read_to_string(token_file).await?;
    let tokens = parse_token_file(&text)?;

    let config_directory = config_directory.to_path_buf();
    tokio::task::spawn_blocking(move || update_cassandra_yaml(&config_directory, &tokens)).await?
}
