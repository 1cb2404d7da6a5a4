//! Backup of one node.

use super::manifest::{
    build_manifest, prepare_manifest_file, save_manifest, EntryType, ManifestEntry, DATA_DIR,
    MANIFESTS_DIR,
};
use super::snapshot::{take_snapshot, SnapshotGuard};
use super::staging_directory;
use super::stop::StopSignal;
use super::tokens::{save_token_list, TOKENS_DIR};
use crate::cluster::ClusterControl;
use crate::fs::GlobalLock;
use crate::request::BackupRequest;
use crate::storage::StorageFactory;
use crate::transfer::{
    upload_or_freshen, ProgressSink, StagedProgress, TransferPolicy, TransferSummary,
};
use crate::utils::errors::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Steps of a backup, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupPhase {
    Init,
    Locked,
    Snapshotting,
    Manifesting,
    BucketCheck,
    Uploading,
    Cleanup,
    ClearSnapshot,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub snapshot_tag: String,
    pub manifest_entries: usize,
    pub phases: Vec<BackupPhase>,
    pub transfer: TransferSummary,
}

pub struct BackupOperation {
    request: BackupRequest,
    cluster: Arc<dyn ClusterControl>,
    storage: Arc<dyn StorageFactory>,
    stop: StopSignal,
}

impl BackupOperation {
    pub fn new(
        request: BackupRequest,
        cluster: Arc<dyn ClusterControl>,
        storage: Arc<dyn StorageFactory>,
    ) -> Self {
        Self {
            request,
            cluster,
            storage,
            stop: StopSignal::new(),
        }
    }

    /// Stop the backup early when `stop` is raised. A taken snapshot is still
    /// cleared before `run` returns.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub async fn run(&self, progress: Arc<dyn ProgressSink>) -> Result<BackupSummary> {
        let request = &self.request;
        let mut phases = vec![BackupPhase::Init];

        info!(
            snapshot_tag = %request.snapshot_tag,
            location = %request.storage_location,
            offline = request.offline_backup,
            "Starting backup"
        );

        let _lock = self
            .stop
            .run(GlobalLock::acquire(&request.lock_file, request.wait_for_lock))
            .await?;
        phases.push(BackupPhase::Locked);

        let (manifest_entries, transfer) = if request.offline_backup {
            // No node to ask, the token file is published empty.
            self.stop
                .run(self.execute_upload(Vec::new(), &mut phases, progress))
                .await?
        } else {
            phases.push(BackupPhase::Snapshotting);
            let taken = self
                .stop
                .run(take_snapshot(
                    Arc::clone(&self.cluster),
                    &request.entities,
                    &request.snapshot_tag,
                ))
                .await;
            let mut snapshot = match taken {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // Stopped mid-request: the node may still have taken it.
                    if self.stop.is_stopped() {
                        SnapshotGuard::new(Arc::clone(&self.cluster), &request.snapshot_tag)
                            .clear()
                            .await;
                    }
                    return Err(e);
                }
            };

            let uploaded = self
                .stop
                .run(async {
                    let tokens = self.cluster.tokens().await?;
                    self.execute_upload(tokens, &mut phases, progress).await
                })
                .await;

            if let Err(e) = &uploaded {
                warn!(snapshot_tag = %request.snapshot_tag, "Backup did not complete: {}", e);
            }
            phases.push(BackupPhase::ClearSnapshot);
            snapshot.clear().await;

            uploaded?
        };

        phases.push(BackupPhase::Done);
        info!(
            snapshot_tag = %request.snapshot_tag,
            entries = manifest_entries,
            transferred = transfer.transferred_entries,
            freshened = transfer.freshened_entries,
            "Backup finished"
        );

        Ok(BackupSummary {
            snapshot_tag: request.snapshot_tag.clone(),
            manifest_entries,
            phases,
            transfer,
        })
    }

    /// Build and publish the manifest of the snapshot. Content entries are
    /// uploaded before the manifest file that lists them.
    async fn execute_upload(
        &self,
        tokens: Vec<String>,
        phases: &mut Vec<BackupPhase>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(usize, TransferSummary)> {
        let request = &self.request;
        let tag = request.snapshot_tag.clone();
        let staging = staging_directory(&request.shared_path);

        phases.push(BackupPhase::Manifesting);
        let data_root = request.cassandra_directory.join(DATA_DIR);
        let entities = request.entities.clone();
        let build_tag = tag.clone();
        let mut manifest =
            tokio::task::spawn_blocking(move || build_manifest(&data_root, &entities, &build_tag))
                .await??;

        let mut local_files: Vec<PathBuf> = Vec::new();

        let token_entry = save_token_list(&staging.join(TOKENS_DIR), &tag, &tokens)?;
        local_files.extend(token_entry.local_file.clone());
        manifest.push(token_entry)?;

        let manifest_path = prepare_manifest_file(&staging.join(MANIFESTS_DIR), &tag)?;
        local_files.push(manifest_path.clone());
        let manifest_entry = save_manifest(&manifest, &manifest_path)?;
        manifest.push(manifest_entry)?;

        phases.push(BackupPhase::BucketCheck);
        {
            let buckets = self.storage.bucket_service(&request.storage_options)?;
            buckets.create_if_missing(&request.storage_location.bucket).await?;
        }

        phases.push(BackupPhase::Uploading);
        let backuper = self
            .storage
            .backuper(&request.storage_location, &request.storage_options)?;
        let policy = TransferPolicy::from(&request.transfer);

        let (manifest_files, content): (Vec<ManifestEntry>, Vec<ManifestEntry>) = manifest
            .entries()
            .iter()
            .cloned()
            .partition(|e| e.entry_type == EntryType::ManifestFile);

        let total_entries = manifest.len();
        let total_bytes = manifest.total_bytes();

        let content_progress = Arc::new(StagedProgress::new(
            Arc::clone(&progress),
            total_entries,
            total_bytes,
        ));
        let mut transfer =
            upload_or_freshen(Arc::clone(&backuper), &content, &policy, content_progress).await?;

        let manifest_progress =
            Arc::new(StagedProgress::new(progress, total_entries, total_bytes).after(&transfer));
        let published =
            upload_or_freshen(backuper, &manifest_files, &policy, manifest_progress).await?;
        transfer.merge(&published);

        phases.push(BackupPhase::Cleanup);
        for file in &local_files {
            if let Err(e) = std::fs::remove_file(file) {
                warn!("Unable to delete local file {}: {}", file.display(), e);
            }
        }

        Ok((total_entries, transfer))
    }
}
