//! Upload and download orchestration.
//!
//! Entries are independent, so they are fanned out over a worker pool bounded
//! by a semaphore. Each entry is retried on its own; the run fails only after
//! every entry has settled. A background task reports progress every 250ms.

use super::progress::{format_bytes, format_duration, format_speed, ProgressSink, ProgressTracker};
use super::{BandwidthLimiter, TransferMeter};
use crate::executor::manifest::ManifestEntry;
use crate::request::TransferSettings;
use crate::storage::{Backuper, Restorer};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Limits applied to one run
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    pub concurrency: usize,
    pub retries: u32,
    pub bandwidth: Option<u64>,
    /// Delay before the first retry; grows linearly with each attempt
    pub retry_backoff: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self::from(&TransferSettings::default())
    }
}

impl From<&TransferSettings> for TransferPolicy {
    fn from(settings: &TransferSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            retries: settings.retries,
            bandwidth: settings.bandwidth,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferSummary {
    pub entries: usize,
    pub transferred_entries: usize,
    pub freshened_entries: usize,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub duration_secs: f64,
}

impl TransferSummary {
    /// Fold a later run of the same operation into this one.
    pub fn merge(&mut self, other: &TransferSummary) {
        self.entries += other.entries;
        self.transferred_entries += other.transferred_entries;
        self.freshened_entries += other.freshened_entries;
        self.transferred_bytes += other.transferred_bytes;
        self.total_bytes += other.total_bytes;
        self.duration_secs += other.duration_secs;
    }
}

/// A remote object and where it goes on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub key: String,
    pub target: PathBuf,
    pub size: u64,
}

struct TransferItem {
    key: String,
    local: PathBuf,
    size: u64,
}

enum Outcome {
    Transferred(u64),
    Freshened,
}

#[async_trait]
trait EntryWorker: Send + Sync + 'static {
    async fn process(&self, item: &TransferItem, meter: &TransferMeter) -> Result<Outcome>;
}

struct UploadWorker {
    backuper: Arc<dyn Backuper>,
}

#[async_trait]
impl EntryWorker for UploadWorker {
    async fn process(&self, item: &TransferItem, meter: &TransferMeter) -> Result<Outcome> {
        let metadata = tokio::fs::metadata(&item.local).await?;

        if let Some(remote) = self.backuper.remote_object(&item.key).await? {
            let local_modified: DateTime<Utc> = metadata.modified()?.into();

            if remote.size == metadata.len() && remote.last_modified >= local_modified {
                debug!(key = %item.key, "Freshening");
                self.backuper.freshen(&item.key).await?;
                return Ok(Outcome::Freshened);
            }
        }

        self.backuper.upload_file(&item.local, &item.key, meter).await?;
        Ok(Outcome::Transferred(meter.transferred()))
    }
}

struct DownloadWorker {
    restorer: Arc<dyn Restorer>,
}

#[async_trait]
impl EntryWorker for DownloadWorker {
    async fn process(&self, item: &TransferItem, meter: &TransferMeter) -> Result<Outcome> {
        if let Ok(existing) = tokio::fs::metadata(&item.local).await {
            if existing.is_file() && existing.len() == item.size {
                debug!(key = %item.key, "Already present locally");
                return Ok(Outcome::Freshened);
            }
        }

        let written = self.restorer.download_file(&item.key, &item.local, meter).await?;
        if written != item.size {
            return Err(BackupError::transfer(
                &item.key,
                format!("expected {} bytes, received {}", item.size, written),
            ));
        }

        Ok(Outcome::Transferred(written))
    }
}

/// Upload every entry unless an identical object is already stored, in which
/// case the object is freshened instead.
pub async fn upload_or_freshen(
    backuper: Arc<dyn Backuper>,
    entries: &[ManifestEntry],
    policy: &TransferPolicy,
    progress: Arc<dyn ProgressSink>,
) -> Result<TransferSummary> {
    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let local = entry.local_file.clone().ok_or_else(|| {
            BackupError::transfer(&entry.object_key, "entry has no local file to upload")
        })?;
        items.push(TransferItem {
            key: entry.object_key.clone(),
            local,
            size: entry.size,
        });
    }

    run_transfers(Arc::new(UploadWorker { backuper }), items, policy, progress, "Upload").await
}

/// Download every object unless a local file of the expected size exists.
pub async fn download_or_skip(
    restorer: Arc<dyn Restorer>,
    downloads: Vec<Download>,
    policy: &TransferPolicy,
    progress: Arc<dyn ProgressSink>,
) -> Result<TransferSummary> {
    let items = downloads
        .into_iter()
        .map(|d| TransferItem {
            key: d.key,
            local: d.target,
            size: d.size,
        })
        .collect();

    run_transfers(Arc::new(DownloadWorker { restorer }), items, policy, progress, "Download").await
}

async fn run_transfers(
    worker: Arc<dyn EntryWorker>,
    items: Vec<TransferItem>,
    policy: &TransferPolicy,
    progress: Arc<dyn ProgressSink>,
    direction: &'static str,
) -> Result<TransferSummary> {
    let total_entries = items.len();
    let total_bytes: u64 = items.iter().map(|i| i.size).sum();

    info!(
        "{} of {} entries ({}) with concurrency {}{}",
        direction,
        total_entries,
        format_bytes(total_bytes),
        policy.concurrency,
        policy
            .bandwidth
            .map(|b| format!(", limited to {}", format_speed(b)))
            .unwrap_or_default()
    );

    let completed_entries = Arc::new(AtomicUsize::new(0));
    let freshened_entries = Arc::new(AtomicUsize::new(0));
    let completed_bytes = Arc::new(AtomicU64::new(0));
    let active: Arc<RwLock<HashMap<usize, TransferMeter>>> = Arc::new(RwLock::new(HashMap::new()));

    let limiter = policy.bandwidth.map(|b| Arc::new(BandwidthLimiter::new(b)));
    let semaphore = Arc::new(Semaphore::new(policy.concurrency.max(1)));
    let stop = CancellationToken::new();
    let mut tracker = ProgressTracker::new(total_bytes, total_entries);

    let mut reporter = JoinSet::new();
    {
        let progress = Arc::clone(&progress);
        let completed_entries = Arc::clone(&completed_entries);
        let freshened_entries = Arc::clone(&freshened_entries);
        let completed_bytes = Arc::clone(&completed_bytes);
        let active = Arc::clone(&active);
        let stop = stop.clone();
        let mut tracker = ProgressTracker::new(total_bytes, total_entries);

        reporter.spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                let inflight: u64 = active.read().await.values().map(TransferMeter::transferred).sum();
                let report = tracker.update(
                    completed_entries.load(Ordering::Relaxed),
                    freshened_entries.load(Ordering::Relaxed),
                    completed_bytes.load(Ordering::Relaxed) + inflight,
                );
                progress.report(report).await;
            }
        });
    }

    let mut workers = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let worker = Arc::clone(&worker);
        let semaphore = Arc::clone(&semaphore);
        let limiter = limiter.clone();
        let completed_entries = Arc::clone(&completed_entries);
        let freshened_entries = Arc::clone(&freshened_entries);
        let completed_bytes = Arc::clone(&completed_bytes);
        let active = Arc::clone(&active);
        let retries = policy.retries;
        let backoff = policy.retry_backoff;

        workers.spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| BackupError::transfer(&item.key, e))?;

            let mut attempt = 0u32;
            loop {
                let meter = TransferMeter::new(limiter.clone());
                active.write().await.insert(idx, meter.clone());

                let result = worker.process(&item, &meter).await;
                active.write().await.remove(&idx);

                match result {
                    Ok(Outcome::Transferred(bytes)) => {
                        completed_bytes.fetch_add(bytes, Ordering::Relaxed);
                        completed_entries.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Ok(Outcome::Freshened) => {
                        freshened_entries.fetch_add(1, Ordering::Relaxed);
                        completed_entries.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(e) if attempt < retries => {
                        attempt += 1;
                        warn!(
                            key = %item.key,
                            attempt,
                            retries,
                            "Transfer failed, retrying: {}", e
                        );
                        tokio::time::sleep(backoff * attempt).await;
                    }
                    Err(BackupError::Transfer { key, reason }) => {
                        return Err(BackupError::Transfer { key, reason });
                    }
                    Err(e) => return Err(BackupError::transfer(&item.key, e)),
                }
            }
        });
    }

    let mut first_error = None;
    let mut failed = 0usize;

    while let Some(joined) = workers.join_next().await {
        let outcome = joined.map_err(BackupError::from).and_then(|r| r);
        if let Err(e) = outcome {
            failed += 1;
            warn!("{} entry failed: {}", direction, e);
            first_error.get_or_insert(e);
        }
    }

    stop.cancel();
    while reporter.join_next().await.is_some() {}

    let transferred_bytes = completed_bytes.load(Ordering::Relaxed);
    let final_report = tracker.update(
        completed_entries.load(Ordering::Relaxed),
        freshened_entries.load(Ordering::Relaxed),
        transferred_bytes,
    );
    progress.report(final_report.clone()).await;

    if let Some(e) = first_error {
        warn!("{} failed: {} of {} entries could not be transferred", direction, failed, total_entries);
        return Err(e);
    }

    let elapsed = tracker.elapsed();
    let summary = TransferSummary {
        entries: total_entries,
        transferred_entries: final_report.completed_entries - final_report.freshened_entries,
        freshened_entries: final_report.freshened_entries,
        transferred_bytes,
        total_bytes,
        duration_secs: elapsed.as_secs_f64(),
    };

    info!(
        "{} completed: {} transferred ({}), {} already current, {} at {}",
        direction,
        summary.transferred_entries,
        format_bytes(transferred_bytes),
        summary.freshened_entries,
        format_duration(elapsed.as_secs()),
        format_speed(tracker.average_speed(transferred_bytes))
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::EntryType;
    use crate::request::{StorageLocation, StorageOptions};
    use crate::storage::{MemoryBuckets, ObjectStoreFactory, RemoteObject, StorageFactory};
    use crate::transfer::{NoProgress, ProgressReport};
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<ProgressReport>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, report: ProgressReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    fn entries(dir: &Path, files: &[(&str, &[u8])]) -> Vec<ManifestEntry> {
        files
            .iter()
            .map(|(name, content)| {
                let path = dir.join(name);
                fs::write(&path, content).unwrap();
                ManifestEntry::local(format!("data/ks1/t1/{}", name), path, EntryType::File).unwrap()
            })
            .collect()
    }

    fn backuper(buckets: &MemoryBuckets) -> Arc<dyn Backuper> {
        ObjectStoreFactory::memory(buckets.clone())
            .backuper(&StorageLocation::parse("memory://bucket").unwrap(), &StorageOptions::default())
            .unwrap()
    }

    fn fast_policy(retries: u32) -> TransferPolicy {
        TransferPolicy {
            concurrency: 2,
            retries,
            bandwidth: None,
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_second_upload_is_pure_freshen() {
        let temp_dir = TempDir::new().unwrap();
        let entries = entries(
            temp_dir.path(),
            &[("a-Data.db", b"aaaa"), ("a-Index.db", b"ii"), ("b-Data.db", b"bbbbbb")],
        );
        let buckets = MemoryBuckets::default();
        let policy = fast_policy(0);

        let first = upload_or_freshen(backuper(&buckets), &entries, &policy, Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(first.transferred_entries, 3);
        assert_eq!(first.transferred_bytes, 12);

        let sink = Arc::new(RecordingSink::default());
        let second = upload_or_freshen(backuper(&buckets), &entries, &policy, sink.clone())
            .await
            .unwrap();
        assert_eq!(second.transferred_entries, 0);
        assert_eq!(second.freshened_entries, 3);
        assert_eq!(second.transferred_bytes, 0);

        let last = sink.reports.lock().unwrap().last().cloned().unwrap();
        assert!(last.is_complete());
        assert_eq!(last.completed_entries, 3);
    }

    #[tokio::test]
    async fn test_changed_size_is_uploaded_again() {
        let temp_dir = TempDir::new().unwrap();
        let buckets = MemoryBuckets::default();
        let policy = fast_policy(0);

        let original = entries(temp_dir.path(), &[("a-Data.db", b"aaaa")]);
        upload_or_freshen(backuper(&buckets), &original, &policy, Arc::new(NoProgress))
            .await
            .unwrap();

        let changed = entries(temp_dir.path(), &[("a-Data.db", b"aaaaaaaa")]);
        let summary = upload_or_freshen(backuper(&buckets), &changed, &policy, Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(summary.transferred_entries, 1);
        assert_eq!(summary.transferred_bytes, 8);
    }

    /// Fails the first `failures` uploads of every key
    struct FlakyBackuper {
        failures: u32,
        attempts: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl Backuper for FlakyBackuper {
        async fn remote_object(&self, _key: &str) -> Result<Option<RemoteObject>> {
            Ok(None)
        }

        async fn upload_file(&self, local: &Path, key: &str, meter: &TransferMeter) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(key.to_string()).or_default();
                *count += 1;
                *count
            };
            if attempt <= self.failures {
                return Err(BackupError::Storage("connection reset".to_string()));
            }
            meter.record(fs::metadata(local)?.len()).await;
            Ok(())
        }

        async fn freshen(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retries_recover_transient_failures() {
        let temp_dir = TempDir::new().unwrap();
        let entries = entries(temp_dir.path(), &[("a-Data.db", b"aaaa"), ("b-Data.db", b"bb")]);
        let flaky = Arc::new(FlakyBackuper {
            failures: 2,
            attempts: Mutex::new(HashMap::new()),
        });

        let summary = upload_or_freshen(flaky.clone(), &entries, &fast_policy(2), Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(summary.transferred_entries, 2);
        assert_eq!(summary.transferred_bytes, 6);
        assert!(flaky.attempts.lock().unwrap().values().all(|&n| n == 3));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_after_all_entries_settle() {
        let temp_dir = TempDir::new().unwrap();
        let entries = entries(temp_dir.path(), &[("a-Data.db", b"aaaa"), ("b-Data.db", b"bb")]);
        let flaky = Arc::new(FlakyBackuper {
            failures: 5,
            attempts: Mutex::new(HashMap::new()),
        });

        let err = upload_or_freshen(flaky.clone(), &entries, &fast_policy(1), Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Transfer { .. }));

        let attempts = flaky.attempts.lock().unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.values().all(|&n| n == 2));
    }

    #[tokio::test]
    async fn test_download_skips_present_files() {
        let temp_dir = TempDir::new().unwrap();
        let buckets = MemoryBuckets::default();
        let uploaded = entries(temp_dir.path(), &[("a-Data.db", b"aaaa"), ("b-Data.db", b"bb")]);
        upload_or_freshen(backuper(&buckets), &uploaded, &fast_policy(0), Arc::new(NoProgress))
            .await
            .unwrap();

        let restore_dir = temp_dir.path().join("restore");
        fs::create_dir_all(&restore_dir).unwrap();
        fs::write(restore_dir.join("a-Data.db"), b"aaaa").unwrap();

        let downloads = uploaded
            .iter()
            .map(|e| Download {
                key: e.object_key.clone(),
                target: restore_dir.join(e.local_file.as_ref().unwrap().file_name().unwrap()),
                size: e.size,
            })
            .collect();

        let restorer = ObjectStoreFactory::memory(buckets.clone())
            .restorer(&StorageLocation::parse("memory://bucket").unwrap(), &StorageOptions::default())
            .unwrap();
        let summary = download_or_skip(restorer, downloads, &fast_policy(0), Arc::new(NoProgress))
            .await
            .unwrap();

        assert_eq!(summary.freshened_entries, 1);
        assert_eq!(summary.transferred_entries, 1);
        assert_eq!(fs::read(restore_dir.join("b-Data.db")).unwrap(), b"bb");
    }

    #[tokio::test]
    async fn test_upload_requires_local_file() {
        let entry = ManifestEntry::remote("data/ks1/t1/a-Data.db", 4);
        let err = upload_or_freshen(
            backuper(&MemoryBuckets::default()),
            &[entry],
            &fast_policy(0),
            Arc::new(NoProgress),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::Transfer { .. }));
    }
}
